use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use nskit_formats::lexer::{Lexer, TokenKind};

/// Script-container token dump
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Arguments {
    /// Path to the script directory
    #[arg(short, long)]
    input: PathBuf,

    /// Label to jump to
    #[arg(short, long)]
    label: Option<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Arguments::parse();

    let mut lx = Lexer::open(&args.input)
        .with_context(|| format!("opening script in {}", args.input.display()))?;

    let (w, h) = lx.mode();
    let (var_range, globals) = lx.var_range();
    println!("mode {w}x{h} vars {var_range} globals {globals}");

    if let Some(label) = &args.label {
        lx.jump_label(label.trim_start_matches('*'))
            .with_context(|| format!("jumping to *{label}"))?;
    }

    let mut count = 0u32;
    loop {
        let t = lx.next()?;
        println!(
            "Token({:?},{:?},pos={},line={},end={:?},wait={:?},color={:?})",
            t.kind, t.text, t.pos, t.line, t.end, t.wait_at, t.color
        );
        if t.kind == TokenKind::Eof {
            break;
        }
        count += 1;
        if args.label.is_some() && count > 40 {
            break;
        }
    }
    Ok(())
}
