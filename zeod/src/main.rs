use clap::Parser;
use libzeod::StorageLoader;
use std::path::PathBuf;
use tokio::fs::read_to_string;
use tokio::net::TcpListener;
use tracing::info;
use zeod::conf::Conf;
use zeod::monitor::start_monitor_server_loop;
use zeod::registry::StorageServer;
use zeod::server::start_zeo_server_loop;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
  /// Path to the configuration file.
  #[arg(long)]
  config: PathBuf,
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt::init();

  let cli = Cli::parse();

  let conf_raw = read_to_string(cli.config).await.expect("read config file");
  let conf: Conf = toml::from_str(&conf_raw).expect("parse config file");

  let mut storages = Vec::new();
  for storage in conf.storages.iter() {
    let storage = StorageLoader::new(storage.storage_cfg())
      .load_and_start()
      .await
      .expect("open storage");
    storages.push(storage);
  }
  let server = StorageServer::new(conf.server_cfg(), storages);

  if let Some(port) = conf.monitor_port {
    tokio::spawn(start_monitor_server_loop(
      conf.monitor_interface.unwrap_or(conf.interface),
      port,
      server.clone(),
    ));
  };

  let listener = TcpListener::bind((conf.interface, conf.port))
    .await
    .expect("bind server socket");
  tokio::select! {
    _ = start_zeo_server_loop(listener, server.clone()) => {}
    res = tokio::signal::ctrl_c() => {
      res.expect("listen for shutdown signal");
      info!("shutdown requested");
    }
  };
  server.close().await;
}
