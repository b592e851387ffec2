use std::path::Path;

use ljr_journal::reader::{JournalLine, JournalReader, PropertyRecord, ReadResult};
use ljr_journal::recovery;
use tracing_subscriber::EnvFilter;

mod scenario;
mod sensor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("");
    let out = parse_flag_string(&args, "--out");

    match (cmd, args.get(2)) {
        ("record", Some(scenario_path)) => {
            scenario::run_record_cli(scenario_path, out.as_deref()).await?
        }
        ("inspect", Some(journal)) => run_inspect(Path::new(journal))?,
        ("recover", Some(journal)) => run_recover(Path::new(journal))?,
        _ => {
            eprintln!("Usage: ljr-recorder record <scenario.toml> [--out <path>]");
            eprintln!("       ljr-recorder inspect <journal>");
            eprintln!("       ljr-recorder recover <journal>");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn parse_flag_string(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn run_inspect(path: &Path) -> anyhow::Result<()> {
    println!("=== Journal: {} ===", path.display());
    let mut reader = JournalReader::open(path)?;

    loop {
        match reader.read_line()? {
            ReadResult::Line(line) => {
                let n = reader.lines_read();
                match line {
                    JournalLine::Header(h) => println!(
                        "{n:>6} header  prot_version={} devicetype={} protocol={} timestamp={}",
                        h.prot_version, h.devicetype, h.protocol, h.timestamp
                    ),
                    JournalLine::Prop(props) if n == 2 => {
                        println!("{n:>6} schema  {} properties", props.len());
                        for p in &props {
                            println!("         {}", describe(p));
                        }
                    }
                    JournalLine::Prop(props) => {
                        for p in &props {
                            println!("{n:>6} prop    {}", describe(p));
                        }
                    }
                    JournalLine::Frame(f) => println!(
                        "{n:>6} frame   ts={} states={} echoes={}",
                        f.ts,
                        f.states.as_ref().map_or(0, Vec::len),
                        f.echoes.as_ref().map_or(0, Vec::len),
                    ),
                }
            }
            ReadResult::Eof => break,
            ReadResult::Torn { offset } => {
                println!("torn tail after byte {offset}; run `recover` to truncate it");
                break;
            }
        }
    }

    println!("\n{} complete lines.", reader.lines_read());
    Ok(())
}

fn describe(p: &PropertyRecord) -> String {
    match &p.val {
        Some(val) => format!("id={} val={val}", p.id),
        None => format!("id={} (no value)", p.id),
    }
}

fn run_recover(path: &Path) -> anyhow::Result<()> {
    let report = recovery::recover(path)?;
    println!("=== Recovered: {} ===", path.display());
    println!(
        "headers={} schemas={} frames={} property_changes={}",
        report.headers, report.schemas, report.frames, report.property_changes
    );
    if report.truncated_bytes > 0 {
        println!("Truncated {} bytes of torn tail.", report.truncated_bytes);
    } else {
        println!("Journal was intact.");
    }
    Ok(())
}
