use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;

use serialecho::echo::{run_echo_loop, EchoSettings};
use serialecho::port::Port;

#[cfg(target_os = "linux")]
const DEFAULT_PORT: &str = "/dev/ttyO0";
#[cfg(not(target_os = "linux"))]
const DEFAULT_PORT: &str = "/dev/ttyu1";

const DEFAULT_SPEED: u32 = 115200;

/// Echo test a serial port with tx/rx jumpered.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Serial device to test
    #[arg(short, long, default_value = DEFAULT_PORT)]
    port: String,

    /// Line speed in baud
    #[arg(short, long, default_value_t = DEFAULT_SPEED)]
    speed: u32,

    /// List detected serial ports and exit
    #[arg(short, long)]
    list: bool,
}

fn list_ports() {
    match serialport::available_ports() {
        Ok(ports) if !ports.is_empty() => {
            for p in ports {
                println!("{}", p.port_name);
            }
        }
        Ok(_) => println!("no serial ports detected"),
        Err(e) => eprintln!("[ECHO/PORTS] enumeration failed: {e}"),
    }
}

/// Parse the command line, or terminate. Help still goes to stdout, but
/// exits with a failure status as this tool always has; usage errors keep
/// clap's conventions.
fn parse_args() -> Args {
    match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp => 1,
                _ => e.exit_code(),
            };
            std::process::exit(code);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = parse_args();

    if args.list {
        list_ports();
        return Ok(());
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        // The handler only flips the flag; the loop polls it between
        // operations and winds down on its own.
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("failed to register interrupt handler")?;
    }

    let mut port = Port::open(&args.port, args.speed)?;
    println!("{} @ {}", port.path(), args.speed);

    let stats = run_echo_loop(&mut port, &EchoSettings::default(), &stop)?;

    println!(
        "stopped after {} cycles ({} partial reads, {} mismatches)",
        stats.cycles, stats.partial_reads, stats.mismatches
    );
    Ok(())
}
