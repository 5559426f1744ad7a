use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

use retroterm::{ByteLink, Config, TerminalSession};

fn main() {
    let config = match Config::load("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };

    if let Err(e) = retroterm::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        retroterm::logging::init_console_only(&config.logging.level);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");

    if let Err(e) = rt.block_on(run(config)) {
        error!("session error: {e}");
        std::process::exit(1);
    }
}

enum Step {
    Pumped(bool),
    Input(Option<String>),
}

async fn run(config: Config) -> retroterm::Result<()> {
    info!(
        "connecting to {}:{}",
        config.connection.host, config.connection.port
    );
    let link = ByteLink::connect(
        &config.connection.host,
        config.connection.port,
        Duration::from_secs(config.connection.connect_timeout_secs),
    )
    .await?;

    let mut session = TerminalSession::new(link, config.terminal.width, config.terminal.height);
    session.parser_mut().set_bell_callback(|| {
        info!("bell");
    });

    // Stdin lines arrive over a channel so the main loop stays select-friendly.
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if input_tx.send(line).is_err() {
                break;
            }
        }
    });

    info!("connected - type lines to send, Ctrl-D to quit");
    loop {
        let step = tokio::select! {
            pumped = session.pump(Duration::from_millis(100)) => Step::Pumped(pumped),
            line = input_rx.recv() => Step::Input(line),
        };

        match step {
            Step::Pumped(pumped) => {
                if !pumped && !session.is_connected() {
                    info!("peer closed the connection");
                    break;
                }
            }
            Step::Input(Some(text)) => {
                session.send_text(&text).await?;
                session.send_key(0x0D).await?;
            }
            Step::Input(None) => break,
        }
    }

    println!("{}", session.screen().screen_text());
    session.link().close().await;
    Ok(())
}
