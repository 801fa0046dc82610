//! ---
//! ddp_section: "15-testing-qa-runbook"
//! ddp_subsection: "integration-tests"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "End-to-end tests of the device listener over real sockets."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ddp_core::{
    spawn_listener, CalibratedSample, CalibrationCoefficients, CoefficientTable, Collaborators,
    DeviceSupervisor, SampleSink, SupervisorConfig, TracingActuator,
};
use ddp_metrics::{new_registry, SharedRegistry};
use ddp_msg::{Connection, DeviceId, FramedConnection, Message, WireFormat};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingSink {
    samples: Mutex<Vec<CalibratedSample>>,
}

#[async_trait]
impl SampleSink for RecordingSink {
    async fn store(&self, sample: CalibratedSample) -> anyhow::Result<()> {
        self.samples.lock().push(sample);
        Ok(())
    }
}

struct Platform {
    supervisor: DeviceSupervisor,
    sink: Arc<RecordingSink>,
    registry: SharedRegistry,
    addr: SocketAddr,
    listener: ddp_core::ListenerServer,
}

fn start_platform() -> Platform {
    let sink = Arc::new(RecordingSink::default());
    let coefficients: CoefficientTable = (1..=8u8)
        .map(|id| (DeviceId(id), CalibrationCoefficients::new(2.0, f64::from(id))))
        .collect();
    let registry = new_registry();
    let supervisor = DeviceSupervisor::new(
        SupervisorConfig::default(),
        Collaborators {
            coefficients: Arc::new(coefficients),
            sink: sink.clone(),
            actuator: Arc::new(TracingActuator),
        },
        Some(registry.clone()),
    )
    .unwrap();
    let listener = spawn_listener(supervisor.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
    Platform {
        supervisor,
        sink,
        registry,
        addr: listener.addr(),
        listener,
    }
}

async fn connect(addr: SocketAddr, label: &str) -> FramedConnection<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    FramedConnection::new(stream, WireFormat::default(), label)
}

async fn round_trip(connection: &mut FramedConnection<TcpStream>, message: Message) -> Message {
    connection.send(message).await.unwrap();
    timeout(STEP, connection.recv())
        .await
        .expect("reply within timeout")
        .unwrap()
        .expect("reply before close")
}

async fn run_device(addr: SocketAddr, device_id: u8, samples: u64) {
    let mut connection = connect(addr, "platform").await;
    let ack = round_trip(
        &mut connection,
        Message::Announce {
            device_id: DeviceId(device_id),
            sample_count: samples,
        },
    )
    .await;
    assert_eq!(ack, Message::AnnounceAck);

    for index in 0..samples {
        let reply = round_trip(
            &mut connection,
            Message::Data {
                timestamp: 1_000 + index,
                raw_value: 10 * index,
            },
        )
        .await;
        assert_eq!(
            reply,
            Message::DataAck {
                remaining_count: samples - index - 1
            }
        );
    }

    connection.send(Message::Terminate).await.unwrap();
    let closed = timeout(STEP, connection.recv()).await.unwrap().unwrap();
    assert_eq!(closed, None);
}

fn counter_value(registry: &SharedRegistry, name: &str, label: Option<(&str, &str)>) -> u64 {
    registry
        .gather()
        .iter()
        .filter(|family| family.get_name() == name)
        .flat_map(|family| family.get_metric().iter())
        .filter(|metric| match label {
            Some((key, value)) => metric
                .get_label()
                .iter()
                .any(|pair| pair.get_name() == key && pair.get_value() == value),
            None => true,
        })
        .map(|metric| metric.get_counter().get_value() as u64)
        .sum()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_devices_stream_over_tcp() {
    let platform = start_platform();

    join_all((1..=4u8).map(|id| run_device(platform.addr, id, 5))).await;

    let samples = platform.sink.samples.lock().clone();
    assert_eq!(samples.len(), 20);
    for sample in &samples {
        let expected = 2.0 * sample.raw_value as f64 + f64::from(sample.device_id.get());
        assert_eq!(sample.value, expected);
    }
    for id in 1..=4u8 {
        let mut timestamps: Vec<_> = samples
            .iter()
            .filter(|sample| sample.device_id == DeviceId(id))
            .map(|sample| sample.timestamp)
            .collect();
        let in_order = timestamps.clone();
        timestamps.sort();
        assert_eq!(timestamps, in_order, "device {id} samples out of order");
    }

    assert_eq!(
        counter_value(&platform.registry, "ddp_messages_total", Some(("kind", "data"))),
        20
    );
    assert_eq!(
        counter_value(
            &platform.registry,
            "ddp_messages_total",
            Some(("kind", "announce"))
        ),
        4
    );

    platform.listener.shutdown().await.unwrap();
    platform.supervisor.shutdown();
}

#[tokio::test]
async fn device_can_reconnect_after_a_completed_session() {
    let platform = start_platform();
    run_device(platform.addr, 6, 2).await;
    run_device(platform.addr, 6, 3).await;
    assert_eq!(platform.sink.samples.lock().len(), 5);
    platform.listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn undecodable_bytes_drop_only_that_connection() {
    let platform = start_platform();

    let mut raw = TcpStream::connect(platform.addr).await.unwrap();
    raw.write_all(&[0x09, 0x00, 0x00]).await.unwrap();
    let mut buf = [0u8; 8];
    let read = timeout(STEP, raw.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    run_device(platform.addr, 2, 1).await;
    assert_eq!(platform.sink.samples.lock().len(), 1);
    platform.listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_device_is_refused() {
    let platform = start_platform();
    let mut connection = connect(platform.addr, "platform").await;
    connection
        .send(Message::Announce {
            device_id: DeviceId(200),
            sample_count: 1,
        })
        .await
        .unwrap();
    let reply = timeout(STEP, connection.recv()).await.unwrap();
    assert!(matches!(reply, Ok(None) | Err(_)));
    assert!(platform.supervisor.active_devices().is_empty());
    platform.listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn listener_shutdown_stops_accepting() {
    let platform = start_platform();
    let addr = platform.addr;
    platform.listener.shutdown().await.unwrap();
    // The socket is released once the accept loop exits.
    let attempt = timeout(STEP, TcpStream::connect(addr)).await.unwrap();
    assert!(attempt.is_err());
}
