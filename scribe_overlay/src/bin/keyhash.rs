use clap::Parser;
use scribe_overlay::core::Key;
use std::process::ExitCode;

/// Prints the overlay key a string hashes to.
#[derive(Parser)]
#[command(name = "keyhash")]
struct Args {
  /// The string to hash, e.g. `127.0.0.1:16783` or a group name.
  input: String,
  /// Digit base of the output.
  #[arg(short, long, default_value_t = 16, value_parser = parse_base)]
  base: u32,
}

fn parse_base(s: &str) -> Result<u32, String> {
  match s.parse::<u32>() {
    Ok(b @ (4 | 16)) => Ok(b),
    _ => Err(format!("base must be 4 or 16, got {:?}", s)),
  }
}

fn main() -> ExitCode {
  let args = Args::parse();
  match Key::hash(args.input.as_bytes()).to_string_base(args.base) {
    Some(s) => {
      println!("{}", s);
      ExitCode::SUCCESS
    }
    None => {
      eprintln!("unsupported base {}", args.base);
      ExitCode::FAILURE
    }
  }
}
