use clap::{Parser, Subcommand};
use rperf2::{Client, Config, Protocol, Report, Server, TestMode};
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "rperf2")]
#[command(about = "An iperf2-compatible network throughput tester", long_about = None)]
#[command(version)]
struct Cli {
    /// Print reports as JSON lines
    #[arg(short = 'J', long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Server {
        /// Port to listen on
        #[arg(short, long, default_value = "5001")]
        port: u16,

        /// Bind to specific address (a multicast group joins it)
        #[arg(short = 'B', long)]
        bind: Option<IpAddr>,

        /// Use UDP instead of TCP
        #[arg(short, long)]
        udp: bool,
    },

    /// Run in client mode
    Client {
        /// Server address to connect to
        server: String,

        /// Port to connect to
        #[arg(short, long, default_value = "5001")]
        port: u16,

        /// Local address to send from
        #[arg(short = 'B', long)]
        bind: Option<IpAddr>,

        /// Use UDP instead of TCP
        #[arg(short, long)]
        udp: bool,

        /// Test duration in seconds
        #[arg(short = 't', long, default_value = "10")]
        time: f64,

        /// Bytes to transmit instead of a duration
        #[arg(short = 'n', long)]
        num: Option<u64>,

        /// UDP rate in bits per second, with an optional K, M or G suffix
        #[arg(short, long, value_parser = parse_rate)]
        bandwidth: Option<u32>,

        /// Bytes per write or per datagram
        #[arg(short = 'l', long, default_value = "0")]
        length: u32,

        /// Test direction: send, reverse, dual or tradeoff
        #[arg(short, long, default_value = "send")]
        mode: TestMode,

        /// IP type-of-service byte
        #[arg(short = 'S', long, default_value = "0", value_parser = parse_tos)]
        tos: u8,

        /// Give up after this many seconds, return tests included
        #[arg(long)]
        timeout: Option<f64>,
    },
}

/// Parses "1000", "64K", "10M" or "1G" into bits per second.
fn parse_rate(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let (digits, scale) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 1_000u64),
        Some('m' | 'M') => (&s[..s.len() - 1], 1_000_000),
        Some('g' | 'G') => (&s[..s.len() - 1], 1_000_000_000),
        _ => (s, 1),
    };
    let value: f64 = digits.parse().map_err(|_| format!("invalid rate '{}'", s))?;
    let rate = value * scale as f64;
    if !(1.0..=u32::MAX as f64).contains(&rate) {
        return Err(format!("rate '{}' out of range", s));
    }
    Ok(rate as u32)
}

/// Accepts decimal or 0x-prefixed hex.
fn parse_tos(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid TOS '{}': {}", s, e))
}

fn print_report(report: &Report, json: bool) {
    if json {
        let line = serde_json::json!({
            "timestamp": chrono::Local::now().to_rfc3339(),
            "report": report,
        });
        println!("{}", line);
        return;
    }

    println!(
        "[{}] {} {}: {} 0.0-{:.1} sec  {} bytes  {} Kbits/sec",
        report.session,
        report.protocol,
        report.termination,
        report
            .remote
            .map_or_else(|| "-".to_string(), |addr| addr.to_string()),
        report.duration_ms as f64 / 1000.0,
        report.bytes_transferred,
        report.bandwidth_kbitpsec
    );
    if let Some(udp) = &report.udp {
        println!(
            "[{}] jitter {:.3} ms  lost {}/{} ({:.2}%)  out of order {}",
            report.session,
            udp.jitter_ms(),
            udp.lost,
            udp.datagrams as u64 + udp.lost as u64,
            udp.lost_percent(),
            udp.out_of_order
        );
    }
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let json = cli.json;

    match cli.command {
        Commands::Server { port, bind, udp } => {
            let protocol = if udp { Protocol::Udp } else { Protocol::Tcp };

            let mut config = Config::server(port).with_protocol(protocol).with_json(json);
            if let Some(bind_addr) = bind {
                config = config.with_bind_addr(bind_addr);
            }

            let server =
                Server::new(config).with_callback(move |report: Report| print_report(&report, json));
            cancel_on_ctrl_c(server.cancellation_token().clone());
            server.run().await?;
        }

        Commands::Client {
            server,
            port,
            bind,
            udp,
            time,
            num,
            bandwidth,
            length,
            mode,
            tos,
            timeout,
        } => {
            let protocol = if udp { Protocol::Udp } else { Protocol::Tcp };

            let mut config = Config::client(server, port)
                .with_protocol(protocol)
                .with_test_mode(mode)
                .with_buffer_len(length)
                .with_tos(tos)
                .with_json(json);
            config = match num {
                Some(bytes) => config.with_bytes(bytes),
                None => config.with_duration(Duration::try_from_secs_f64(time).unwrap_or_default()),
            };
            if let Some(rate) = bandwidth {
                config = config.with_bandwidth(rate);
            }
            if let Some(bind_addr) = bind {
                config = config.with_bind_addr(bind_addr);
            }
            if let Some(secs) = timeout {
                config = config.with_timeout(Duration::try_from_secs_f64(secs)?);
            }

            let client =
                Client::new(config)?.with_callback(move |report: Report| print_report(&report, json));
            cancel_on_ctrl_c(client.cancellation_token().clone());
            client.run().await?;
        }
    }

    Ok(())
}
