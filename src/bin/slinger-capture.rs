use slinger_capture::{MitmConfig, MitmProxy};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config_file = std::env::args_os().nth(1).map(PathBuf::from);
  let config = match MitmConfig::load(config_file.as_deref()) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("invalid configuration: {}", e);
      return ExitCode::FAILURE;
    }
  };

  let proxy = match MitmProxy::new(config).await {
    Ok(proxy) => proxy,
    Err(e) => {
      eprintln!("failed to start proxy: {}", e);
      return ExitCode::FAILURE;
    }
  };

  match proxy.ca_cert_path() {
    Some(path) => println!("CA certificate: {}", path.display()),
    None => println!("CA certificate:\n{}", proxy.ca_cert_pem()),
  }
  println!(
    "Install it in your browser or system trust store, then set the proxy to {}",
    proxy.config().listen_addr
  );
  println!("Press Ctrl+C to stop and write {}", proxy.config().capture.output_path.display());

  let shutdown = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!("could not listen for Ctrl+C: {}", e);
      std::future::pending::<()>().await;
    }
    tracing::info!("Ctrl+C received");
  };

  match proxy.run_until(shutdown).await {
    Ok(report) => {
      println!("{} entries written to {}", report.count, report.path.display());
      ExitCode::SUCCESS
    }
    Err(e) => {
      eprintln!("capture failed: {}", e);
      ExitCode::FAILURE
    }
  }
}
