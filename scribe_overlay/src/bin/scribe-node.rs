use clap::Parser;
use scribe_overlay::overlay::{Overlay, OverlayConfig, DEFAULT_PORT, LOG_LEVEL};
use scribe_overlay::testkit::{init_logging, LogLevel};
use scribe_overlay::tree::{ScribeInstance, TreeConfig, TreeEvent};
use std::error::Error;
use std::net::Ipv4Addr;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};

/// Runs one overlay node, optionally joined to a multicast group. Lines read
/// from stdin are multicast to the group.
#[derive(Parser)]
#[command(name = "scribe-node")]
struct Args {
  /// UDP port to listen on.
  #[arg(short, long, default_value_t = DEFAULT_PORT)]
  port: u16,
  /// Address other nodes reach this node at.
  #[arg(short, long, default_value_t = Ipv4Addr::LOCALHOST)]
  address: Ipv4Addr,
  /// `host:port` of a node already in the ring. Starts a new ring if absent.
  #[arg(short, long)]
  bootstrap: Option<String>,
  /// Group URI to join, e.g. `scribe://news`.
  #[arg(short, long)]
  group: Option<String>,
  /// Acknowledge joins, leaves and multicasts.
  #[arg(long)]
  reliable: bool,
  /// Disable the tree maintenance loop.
  #[arg(long)]
  no_maintenance: bool,
  #[arg(long, value_enum, default_value_t = LOG_LEVEL)]
  log_level: LogLevel,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
  let args = Args::parse();
  init_logging(args.log_level);

  let config = OverlayConfig {
    address: args.address,
    port: args.port,
    ..Default::default()
  };
  let overlay = Overlay::new(config).await?;
  let tree = ScribeInstance::new(
    overlay.clone(),
    TreeConfig {
      reliable: args.reliable,
      maintenance: !args.no_maintenance,
      ..Default::default()
    },
  )?;
  let mut events = tree.subscribe();
  tokio::spawn(async move {
    while let Some(event) = events.recv().await {
      match event {
        TreeEvent::Received { uri, payload } => {
          println!("[{}] {}", uri, String::from_utf8_lossy(&payload))
        }
        other => println!("{:?}", other),
      }
    }
  });

  let boot = match args.bootstrap.as_deref() {
    Some(s) => {
      let (name, port) = s.rsplit_once(':').unwrap_or((s, ""));
      let port = if port.is_empty() { DEFAULT_PORT } else { port.parse()? };
      Some(overlay.resolve(name, port).await?)
    }
    None => None,
  };
  overlay.join(boot).await?;
  println!("{} joined as {}", overlay.local_addr(), overlay.key());

  let group = match args.group {
    Some(g) => g,
    None => {
      tokio::signal::ctrl_c().await?;
      return Ok(());
    }
  };
  tree.create(&group).await?;
  tree.join(&group).await?;

  let mut lines = BufReader::new(stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    match line.trim() {
      "" => {}
      "/table" => println!("{}", overlay.table_dump()),
      "/leave" => tree.leave(&group).await?,
      "/join" => tree.join(&group).await?,
      text => {
        tree.send(&group, text.as_bytes()).await?;
      }
    }
  }
  tree.leave(&group).await?;
  overlay.shutdown();
  Ok(())
}
