// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::{Context as AnyhowContext, Result};
use bytes::Bytes;
use clap::{Arg, ArgMatches, Command};
use ilp_http::{HttpTransport, TransportConfig};
use tokio_util::sync::CancellationToken;

fn validate_existing_file(raw: &str) -> Result<(), String> {
  if Path::new(raw).is_file() {
    Ok(())
  } else {
    Err(format!("{} is not an existing file", raw))
  }
}

fn validate_hex(raw: &str) -> Result<(), String> {
  hex::decode(raw.trim())
    .map(|_| ())
    .map_err(|error| format!("packet must be hex-encoded: {}", error))
}

fn config_arg() -> Arg<'static> {
  Arg::new("config")
    .long("config")
    .short('c')
    .help("JSON transport configuration")
    .validator(validate_existing_file)
    .takes_value(true)
    .required(true)
}

fn main() -> Result<()> {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("h2=warn,hyper=warn,info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .finish();
  tracing::subscriber::set_global_default(collector).context("Logger init must succeed")?;
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("listen")
        .about("Accept packets from the configured peer until interrupted")
        .arg(config_arg())
        .arg(
          Arg::new("relay")
            .long("relay")
            .help("Forward incoming packets to the outgoing peer instead of echoing them")
            .takes_value(false),
        ),
    )
    .subcommand(
      Command::new("send")
        .about("Send one hex-encoded packet and print the hex-encoded reply")
        .arg(config_arg())
        .arg(
          Arg::new("packet")
            .long("packet")
            .short('p')
            .validator(validate_hex)
            .takes_value(true)
            .required(true),
        ),
    )
    .subcommand(
      Command::new("validate-config")
        .about("Check a configuration file without binding any ports")
        .arg(config_arg()),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>").to_owned();
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .context("Tokio Runtime setup failure")?;
  match rt.block_on(main_args_handler(&matches)) {
    Err(err) => {
      tracing::error!(mode = %mode, err = ?err, "dispatch_command_failure");
      Err(err)
    }
    Ok(()) => {
      tracing::info!("{} exited successfully", mode);
      Ok(())
    }
  }
}

fn config_path(args: &ArgMatches) -> Result<PathBuf> {
  args
    .value_of("config")
    .map(PathBuf::from)
    .context("Config argument is required")
}

fn load_config(args: &ArgMatches) -> Result<TransportConfig> {
  let path = config_path(args)?;
  TransportConfig::from_json_file(&path)
    .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

async fn main_args_handler(matches: &ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("listen", opts)) => {
      let config = load_config(opts)?;
      listen_main(config, opts.is_present("relay")).await
    }
    Some(("send", opts)) => {
      let config = load_config(opts)?;
      let packet = opts.value_of("packet").context("Packet argument is required")?;
      let packet = hex::decode(packet.trim()).context("Packet must be hex-encoded")?;
      send_main(config, Bytes::from(packet)).await
    }
    Some(("validate-config", opts)) => {
      let config = load_config(opts)?;
      HttpTransport::new(config.clone()).context("Configuration is invalid")?;
      tracing::info!(
        multi = config.multi,
        listen = %config.incoming.listen_addr(),
        outgoing = %config.outgoing.url,
        http2 = config.outgoing.http2,
        "configuration is valid"
      );
      Ok(())
    }
    _ => anyhow::bail!("Subcommand is marked as required"),
  }
}

async fn listen_main(config: TransportConfig, relay: bool) -> Result<()> {
  let transport = Arc::new(HttpTransport::new(config).context("Configuration is invalid")?);
  if relay {
    // Weak, so the handler slot does not keep its own transport alive
    let outbound = Arc::downgrade(&transport);
    transport.register_data_handler(move |packet: Bytes| {
      let outbound = outbound.clone();
      async move {
        let transport = outbound.upgrade().context("Transport was dropped")?;
        Ok::<_, anyhow::Error>(transport.send_data(packet).await?)
      }
    });
  } else {
    transport.register_data_handler(|packet: Bytes| async move { Ok::<_, anyhow::Error>(packet) });
  }
  transport.connect().await?;

  let shutdown = CancellationToken::new();
  {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Interrupt received, shutting down");
      }
      shutdown.cancel();
    });
  }
  shutdown.cancelled().await;
  transport.disconnect().await;
  Ok(())
}

async fn send_main(config: TransportConfig, packet: Bytes) -> Result<()> {
  let transport = HttpTransport::new(config).context("Configuration is invalid")?;
  transport.connect().await?;
  let sent = transport.send_data(packet).await;
  transport.disconnect().await;
  let reply = sent.context("Peer did not accept the packet")?;
  println!("{}", hex::encode(&reply));
  Ok(())
}
