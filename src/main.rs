//! Interactive MQTT client driven by commands read from stdin

use clap::Parser;
use mqtt_engine::config::ClientConfig;
use mqtt_engine::observability::{init_logging, LogFormat};
use mqtt_engine::{Callback, Client, EngineError, EngineResult, Message, MqttEngine, QoS};
use std::path::PathBuf;
use std::process;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::level_filters::LevelFilter;
use tracing::{error, info};

const HELP: &str = "\
commands:
  c|conn [server[:port]]       connect (replaces the current client)
  p|pub topic,qos,msg ...      publish one message per argument
  s|sub topic,qos ...          subscribe to each filter
  u|unsub topic ...            unsubscribe from each filter
  q|exit [force]               destroy the client and quit
  h|help                       show this help";

/// Interactive MQTT client
#[derive(Parser)]
#[command(name = "mqtt-engine")]
#[command(about = "Interactive MQTT client reading commands from stdin")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker address used when `conn` is given none
    #[arg(short, long, env = "MQTT_SERVER")]
    server: Option<String>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format (json, pretty, compact)
    #[arg(long, default_value = "compact")]
    log_format: String,
}

/// One parsed stdin line
#[derive(Debug, PartialEq)]
enum Command {
    Connect(Option<String>),
    Publish(Vec<(String, QoS, String)>),
    Subscribe(Vec<(String, QoS)>),
    Unsubscribe(Vec<String>),
    Quit { force: bool },
    Help,
}

fn parse_qos(value: &str) -> Result<QoS, String> {
    value
        .trim()
        .parse::<u8>()
        .ok()
        .and_then(QoS::from_u8)
        .ok_or_else(|| format!("invalid qos '{value}', expected 0, 1 or 2"))
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match verb {
        "c" | "conn" => Command::Connect(args.first().map(|s| s.to_string())),
        "p" | "pub" => Command::Publish(
            args.iter()
                .map(|arg| {
                    let mut parts = arg.splitn(3, ',');
                    match (parts.next(), parts.next(), parts.next()) {
                        (Some(topic), Some(qos), Some(msg)) => {
                            Ok((topic.to_string(), parse_qos(qos)?, msg.to_string()))
                        }
                        _ => Err(format!("expected topic,qos,msg but got '{arg}'")),
                    }
                })
                .collect::<Result<_, _>>()?,
        ),
        "s" | "sub" => Command::Subscribe(
            args.iter()
                .map(|arg| match arg.split_once(',') {
                    Some((topic, qos)) => Ok((topic.to_string(), parse_qos(qos)?)),
                    None => Err(format!("expected topic,qos but got '{arg}'")),
                })
                .collect::<Result<_, _>>()?,
        ),
        "u" | "unsub" => Command::Unsubscribe(args.iter().map(|s| s.to_string()).collect()),
        "q" | "exit" => Command::Quit {
            force: args.first() == Some(&"force"),
        },
        "h" | "help" => Command::Help,
        other => return Err(format!("unknown command '{other}', try 'help'")),
    };
    Ok(Some(command))
}

/// Prints every result to stdout
struct PrintCallback;

fn outcome<T: std::fmt::Debug>(result: &EngineResult<T>) -> String {
    match result {
        Ok(value) => format!("ok {value:?}"),
        Err(error) => format!("failed: {}", error.description()),
    }
}

impl Callback for PrintCallback {
    fn on_connect(&self, client: &Client, server: &str, result: &EngineResult<()>) {
        println!("[{}] connect {server}: {}", client.identity(), outcome(result));
    }

    fn on_lost(&self, client: &Client, server: &str, error: &EngineError) {
        println!("[{}] lost {server}: {}", client.identity(), error.description());
    }

    fn on_publish(&self, client: &Client, topic: &str, result: &EngineResult<()>) {
        println!("[{}] pub {topic}: {}", client.identity(), outcome(result));
    }

    fn on_subscribe(&self, client: &Client, topic: &str, result: &EngineResult<QoS>) {
        println!("[{}] sub {topic}: {}", client.identity(), outcome(result));
    }

    fn on_unsubscribe(&self, client: &Client, topic: &str, result: &EngineResult<()>) {
        println!("[{}] unsub {topic}: {}", client.identity(), outcome(result));
    }

    fn on_persist_error(&self, client: &Client, error: &EngineError) {
        println!("[{}] persist: {}", client.identity(), error.description());
    }
}

fn print_message(client: &Client, message: &Message) {
    println!(
        "[{}] msg {} (qos {}{}): {}",
        client.identity(),
        message.topic,
        message.qos,
        if message.retain { ", retained" } else { "" },
        message.payload_str()
    );
}

struct Session {
    engine: MqttEngine,
    base: Option<ClientConfig>,
    default_server: Option<String>,
    client: Option<Client>,
}

impl Session {
    fn connect(&mut self, server: Option<String>) -> EngineResult<()> {
        let server = server
            .or_else(|| self.default_server.clone())
            .or_else(|| self.base.as_ref().map(|c| c.server.clone()))
            .ok_or_else(|| EngineError::configuration("server", "no server given"))?;

        if let Some(previous) = self.client.take() {
            let _ = previous.destroy(true);
        }

        let mut builder = self.engine.new_builder(server.clone());
        if let Some(base) = &self.base {
            builder = builder.config(ClientConfig {
                server,
                ..base.clone()
            });
        }
        let client = builder.build()?;
        client.set_callback(PrintCallback)?;
        client.handle_default(print_message)?;
        client.connect()?;
        self.client = Some(client);
        Ok(())
    }

    fn client(&self) -> EngineResult<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| EngineError::operation("not connected, use 'conn' first"))
    }

    /// Returns false once the session should end
    async fn execute(&mut self, command: Command) -> EngineResult<bool> {
        match command {
            Command::Connect(server) => self.connect(server)?,
            Command::Publish(messages) => {
                let client = self.client()?;
                for (topic, qos, msg) in messages {
                    client.publish(&topic, qos, msg)?;
                }
            }
            Command::Subscribe(filters) => {
                let client = self.client()?;
                for (filter, qos) in filters {
                    client.subscribe(&filter, qos)?;
                }
            }
            Command::Unsubscribe(filters) => {
                let client = self.client()?;
                for filter in filters {
                    client.unsubscribe(&filter)?;
                }
            }
            Command::Quit { force } => {
                if let Some(client) = self.client.take() {
                    client.destroy(force)?;
                    let state = client.wait().await;
                    info!(%state, "client closed");
                }
                return Ok(false);
            }
            Command::Help => println!("{HELP}"),
        }
        Ok(true)
    }
}

fn log_level(cli: &Cli, config: Option<&ClientConfig>) -> LevelFilter {
    match cli.verbose {
        0 => config.map_or(LevelFilter::INFO, |c| c.log_level.to_level_filter()),
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let base = match &cli.config {
        Some(path) => match ClientConfig::load_from_file(path) {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("Failed to load configuration from {}: {e}", path.display());
                process::exit(1);
            }
        },
        None => None,
    };

    init_logging(
        log_level(&cli, base.as_ref()),
        LogFormat::parse(&cli.log_format),
        false,
    );
    info!("Starting mqtt-engine v{}", env!("CARGO_PKG_VERSION"));

    let mut session = Session {
        engine: MqttEngine::new(),
        base,
        default_server: cli.server.clone(),
        client: None,
    };
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                Ok(Some("q force".to_string()))
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => "q".to_string(),
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                "q force".to_string()
            }
        };

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };

        match session.execute(command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("error: {}", e.description()),
        }
    }

    info!("Application shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_publish() {
        let command = parse_command("p a/b,1,hello,world c,0,x").unwrap();
        assert_eq!(
            command,
            Some(Command::Publish(vec![
                ("a/b".to_string(), QoS::AtLeastOnce, "hello,world".to_string()),
                ("c".to_string(), QoS::AtMostOnce, "x".to_string()),
            ]))
        );
    }

    #[test]
    fn test_parse_subscribe_and_unsubscribe() {
        assert_eq!(
            parse_command("sub a/#,2").unwrap(),
            Some(Command::Subscribe(vec![("a/#".to_string(), QoS::ExactlyOnce)]))
        );
        assert_eq!(
            parse_command("u a/# b").unwrap(),
            Some(Command::Unsubscribe(vec!["a/#".to_string(), "b".to_string()]))
        );
    }

    #[test]
    fn test_parse_connect_quit_help() {
        assert_eq!(
            parse_command("conn localhost:1884").unwrap(),
            Some(Command::Connect(Some("localhost:1884".to_string())))
        );
        assert_eq!(parse_command("c").unwrap(), Some(Command::Connect(None)));
        assert_eq!(
            parse_command("exit force").unwrap(),
            Some(Command::Quit { force: true })
        );
        assert_eq!(parse_command("q").unwrap(), Some(Command::Quit { force: false }));
        assert_eq!(parse_command("h").unwrap(), Some(Command::Help));
        assert_eq!(parse_command("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("p a/b,1").is_err());
        assert!(parse_command("s a/b,7").is_err());
        assert!(parse_command("frobnicate").is_err());
    }
}
