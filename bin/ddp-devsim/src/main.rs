//! ---
//! ddp_section: "11-simulation"
//! ddp_subsection: "binary"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Simulated physical device for manual testing and demos."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::f64::consts::TAU;
use std::fs::File;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use ddp_common::AppConfig;
use ddp_msg::{Connection, DeviceId, FramedConnection, Message, WireFormat};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Waveform {
    Sine,
    Ramp,
    Constant,
}

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("DDP devsim ", env!("CARGO_PKG_VERSION")),
    about = "Act as a physical device and stream samples to a DDP daemon",
    long_about = None
)]
struct Cli {
    /// Daemon address to connect to
    #[arg(long, default_value = "127.0.0.1:7400")]
    connect: SocketAddr,

    /// Device identifier to announce
    #[arg(long, default_value_t = 1)]
    device_id: u8,

    /// Number of Data messages to send after the Announce
    #[arg(long, default_value_t = 10)]
    samples: u64,

    /// Pause between samples in milliseconds
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,

    /// Shape of the synthetic signal
    #[arg(long, value_enum, default_value_t = Waveform::Sine)]
    waveform: Waveform,

    /// How long to wait for each acknowledgement before re-sending.
    /// Must exceed the daemon's throttle timeout.
    #[arg(long, default_value_t = 5000)]
    ack_timeout_ms: u64,

    /// Re-sends of an unacknowledged sample before giving up
    #[arg(long, default_value_t = 5)]
    max_retries: u32,

    /// Daemon configuration to read protocol widths from
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write a JSON transcript of the session. Use '-' for stdout.
    #[arg(long, value_name = "FILE")]
    transcript: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Direction {
    Sent,
    Received,
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
struct TranscriptEntry {
    elapsed_ms: u128,
    direction: Direction,
    message: Option<Message>,
}

#[derive(Debug, Default, Serialize)]
struct Transcript {
    device_id: u8,
    samples_sent: u64,
    samples_acked: u64,
    entries: Vec<TranscriptEntry>,
}

struct SessionPlan {
    device_id: DeviceId,
    samples: u64,
    interval: Duration,
    ack_timeout: Duration,
    max_retries: u32,
    waveform: Waveform,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let format = WireFormat::from_config(&config.protocol)?;

    if cli.samples > format.max_sample_count() {
        bail!(
            "samples must not exceed {} for a {}-bit count field",
            format.max_sample_count(),
            format.remaining_count_bits()
        );
    }

    let ack_timeout = Duration::from_millis(cli.ack_timeout_ms);
    let throttle_timeout = config.rate_limit.throttle_timeout;
    if ack_timeout <= throttle_timeout {
        bail!(
            "ack timeout of {}ms must exceed the daemon throttle timeout of {}ms",
            ack_timeout.as_millis(),
            throttle_timeout.as_millis()
        );
    }

    let stream = TcpStream::connect(cli.connect)
        .await
        .with_context(|| format!("failed to connect to {}", cli.connect))?;
    stream.set_nodelay(true)?;
    let connection = FramedConnection::new(stream, format, cli.connect.to_string());

    let plan = SessionPlan {
        device_id: DeviceId(cli.device_id),
        samples: cli.samples,
        interval: Duration::from_millis(cli.interval_ms),
        ack_timeout,
        max_retries: cli.max_retries,
        waveform: cli.waveform,
    };
    let transcript = run_session(connection, format, &plan).await?;

    eprintln!(
        "device {} sent {} samples, {} acknowledged",
        transcript.device_id, transcript.samples_sent, transcript.samples_acked
    );
    if let Some(path) = &cli.transcript {
        write_transcript(path, &transcript)?;
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(&[path]),
        None => Ok(AppConfig::default()),
    }
}

async fn run_session<C: Connection>(
    mut connection: C,
    format: WireFormat,
    plan: &SessionPlan,
) -> Result<Transcript> {
    let started = Instant::now();
    let mut transcript = Transcript {
        device_id: plan.device_id.get(),
        ..Transcript::default()
    };

    let announce = Message::Announce {
        device_id: plan.device_id,
        sample_count: plan.samples,
    };
    send(&mut connection, &mut transcript, started, announce).await?;
    match expect_reply(&mut connection, &mut transcript, started, plan.ack_timeout).await? {
        Some(Message::AnnounceAck) => {}
        Some(other) => bail!("expected announce_ack, got {}", other.kind()),
        None => bail!("platform did not accept the announce"),
    }

    for index in 0..plan.samples {
        if index > 0 && !plan.interval.is_zero() {
            sleep(plan.interval).await;
        }
        let data = Message::Data {
            timestamp: (started.elapsed().as_millis() as u64).min(format.max_timestamp()),
            raw_value: sample_value(plan.waveform, index, plan.samples, format.max_raw_value()),
        };
        let expected = plan.samples - index - 1;
        let mut attempts = 0u32;
        loop {
            send(&mut connection, &mut transcript, started, data).await?;
            attempts += 1;
            let reply =
                expect_reply(&mut connection, &mut transcript, started, plan.ack_timeout).await?;
            match reply {
                Some(Message::DataAck { remaining_count }) if remaining_count == expected => break,
                Some(Message::DataAck { remaining_count }) => bail!(
                    "platform reports {remaining_count} samples remaining, expected {expected}"
                ),
                Some(other) => bail!("expected data_ack, got {}", other.kind()),
                // The platform abandoned a throttled sample without advancing the session.
                None if attempts <= plan.max_retries => {}
                None => bail!("sample {index} was not acknowledged after {attempts} attempts"),
            }
        }
        transcript.samples_sent += 1;
        transcript.samples_acked += 1;
    }

    send(&mut connection, &mut transcript, started, Message::Terminate).await?;
    // The platform closes the link after Terminate.
    let _ = timeout(plan.ack_timeout, connection.recv()).await;
    Ok(transcript)
}

async fn send<C: Connection>(
    connection: &mut C,
    transcript: &mut Transcript,
    started: Instant,
    message: Message,
) -> Result<()> {
    connection
        .send(message)
        .await
        .with_context(|| format!("failed to send {}", message.kind()))?;
    transcript.entries.push(TranscriptEntry {
        elapsed_ms: started.elapsed().as_millis(),
        direction: Direction::Sent,
        message: Some(message),
    });
    Ok(())
}

async fn expect_reply<C: Connection>(
    connection: &mut C,
    transcript: &mut Transcript,
    started: Instant,
    wait: Duration,
) -> Result<Option<Message>> {
    match timeout(wait, connection.recv()).await {
        Ok(Ok(Some(message))) => {
            transcript.entries.push(TranscriptEntry {
                elapsed_ms: started.elapsed().as_millis(),
                direction: Direction::Received,
                message: Some(message),
            });
            Ok(Some(message))
        }
        Ok(Ok(None)) => Err(anyhow!("platform closed the connection")),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => {
            transcript.entries.push(TranscriptEntry {
                elapsed_ms: started.elapsed().as_millis(),
                direction: Direction::TimedOut,
                message: None,
            });
            Ok(None)
        }
    }
}

/// Deterministic synthetic ADC reading in `0..=max`.
fn sample_value(waveform: Waveform, index: u64, total: u64, max: u64) -> u64 {
    let period = total.max(1) as f64;
    let fraction = match waveform {
        Waveform::Sine => 0.5 + 0.5 * (TAU * index as f64 / period).sin(),
        Waveform::Ramp => {
            if total <= 1 {
                0.0
            } else {
                index as f64 / (period - 1.0)
            }
        }
        Waveform::Constant => 0.5,
    };
    let value = (fraction.clamp(0.0, 1.0) * max as f64).round();
    (value as u64).min(max)
}

fn write_transcript(path: &Path, transcript: &Transcript) -> Result<()> {
    let writer: Box<dyn Write> = if path.as_os_str() == "-" {
        Box::new(io::stdout())
    } else {
        Box::new(
            File::create(path)
                .with_context(|| format!("failed to create transcript {}", path.display()))?,
        )
    };
    serde_json::to_writer_pretty(writer, transcript)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ddp_common::config::{RateLimitConfig, ThrottleAlgorithm};
    use ddp_core::{
        CalibrationCoefficients, CoefficientTable, Collaborators, DeviceSupervisor,
        SupervisorConfig, TracingActuator, TracingSampleSink,
    };
    use tokio::io::duplex;

    fn plan(samples: u64) -> SessionPlan {
        SessionPlan {
            device_id: DeviceId(7),
            samples,
            interval: Duration::ZERO,
            ack_timeout: Duration::from_millis(200),
            max_retries: 5,
            waveform: Waveform::Ramp,
        }
    }

    #[test]
    fn waveforms_stay_within_the_value_range() {
        let max = WireFormat::default().max_raw_value();
        for waveform in [Waveform::Sine, Waveform::Ramp, Waveform::Constant] {
            for index in 0..50 {
                assert!(sample_value(waveform, index, 50, max) <= max);
            }
        }
        assert_eq!(sample_value(Waveform::Ramp, 0, 10, max), 0);
        assert_eq!(sample_value(Waveform::Ramp, 9, 10, max), max);
        assert_eq!(sample_value(Waveform::Ramp, 0, 1, max), 0);
    }

    #[tokio::test]
    async fn session_follows_the_protocol() {
        let format = WireFormat::default();
        let (device_side, platform_side) = duplex(256);
        let device = FramedConnection::new(device_side, format, "platform");
        let mut platform = FramedConnection::new(platform_side, format, "device");

        let platform_task = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut remaining = 0;
            while let Ok(Some(message)) = platform.recv().await {
                seen.push(message.kind());
                match message {
                    Message::Announce { sample_count, .. } => {
                        remaining = sample_count;
                        platform.send(Message::AnnounceAck).await.unwrap();
                    }
                    Message::Data { .. } => {
                        remaining -= 1;
                        platform
                            .send(Message::DataAck {
                                remaining_count: remaining,
                            })
                            .await
                            .unwrap();
                    }
                    Message::Terminate => break,
                    _ => panic!("unexpected message"),
                }
            }
            seen
        });

        let transcript = run_session(device, format, &plan(3)).await.unwrap();
        assert_eq!(transcript.samples_sent, 3);
        assert_eq!(transcript.samples_acked, 3);
        assert_eq!(transcript.entries.len(), 9);

        let seen = platform_task.await.unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen.first(), Some(&ddp_msg::MessageKind::Announce));
        assert_eq!(seen.last(), Some(&ddp_msg::MessageKind::Terminate));
    }

    #[tokio::test]
    async fn rejected_announce_is_an_error() {
        let format = WireFormat::default();
        let (device_side, platform_side) = duplex(64);
        let device = FramedConnection::new(device_side, format, "platform");
        let mut platform = FramedConnection::new(platform_side, format, "device");
        tokio::spawn(async move {
            let _ = platform.recv().await;
            drop(platform);
        });

        let err = run_session(device, format, &plan(1)).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn mismatched_remaining_count_is_an_error() {
        let format = WireFormat::default();
        let (device_side, platform_side) = duplex(256);
        let device = FramedConnection::new(device_side, format, "platform");
        let mut platform = FramedConnection::new(platform_side, format, "device");
        tokio::spawn(async move {
            let _ = platform.recv().await;
            platform.send(Message::AnnounceAck).await.unwrap();
            let _ = platform.recv().await;
            platform
                .send(Message::DataAck { remaining_count: 0 })
                .await
                .unwrap();
            let _ = platform.recv().await;
        });

        let err = run_session(device, format, &plan(3)).await.unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }

    fn throttling_supervisor(throttle_timeout: Duration) -> DeviceSupervisor {
        let config = SupervisorConfig {
            rate_limit: RateLimitConfig {
                max_messages: 1,
                window: Duration::from_millis(430),
                algorithm: ThrottleAlgorithm::SlidingWindow,
                throttle_timeout,
            },
            ..SupervisorConfig::default()
        };
        let coefficients: CoefficientTable =
            std::iter::once((DeviceId(7), CalibrationCoefficients::new(1.0, 0.0))).collect();
        let collaborators = Collaborators {
            coefficients: Arc::new(coefficients),
            sink: Arc::new(TracingSampleSink),
            actuator: Arc::new(TracingActuator),
        };
        DeviceSupervisor::new(config, collaborators, None).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_samples_are_resent_until_acknowledged() {
        let format = WireFormat::default();
        let supervisor = throttling_supervisor(Duration::from_millis(50));
        let (device_side, platform_side) = duplex(256);
        let device = FramedConnection::new(device_side, format, "platform");
        let platform = FramedConnection::new(platform_side, format, "device");
        let served = tokio::spawn(async move { supervisor.serve_connection(platform).await });

        let plan = SessionPlan {
            ack_timeout: Duration::from_millis(100),
            max_retries: 10,
            ..plan(3)
        };
        let transcript = run_session(device, format, &plan).await.unwrap();
        assert_eq!(transcript.samples_sent, 3);
        assert_eq!(transcript.samples_acked, 3);
        assert!(transcript
            .entries
            .iter()
            .any(|entry| entry.direction == Direction::TimedOut));

        let summary = served.await.unwrap().unwrap();
        assert_eq!(summary.samples_acked, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_sample_gives_up_after_retries() {
        let format = WireFormat::default();
        let supervisor = throttling_supervisor(Duration::from_millis(50));
        let (device_side, platform_side) = duplex(256);
        let device = FramedConnection::new(device_side, format, "platform");
        let platform = FramedConnection::new(platform_side, format, "device");
        tokio::spawn(async move { supervisor.serve_connection(platform).await });

        let plan = SessionPlan {
            ack_timeout: Duration::from_millis(100),
            max_retries: 1,
            ..plan(2)
        };
        let err = run_session(device, format, &plan).await.unwrap_err();
        assert!(err.to_string().contains("after 2 attempts"));
    }

    #[test]
    fn transcript_is_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let transcript = Transcript {
            device_id: 3,
            samples_sent: 1,
            samples_acked: 0,
            entries: vec![TranscriptEntry {
                elapsed_ms: 0,
                direction: Direction::TimedOut,
                message: None,
            }],
        };
        write_transcript(&path, &transcript).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["device_id"], 3);
        assert_eq!(parsed["entries"][0]["direction"], "timed_out");
    }
}
