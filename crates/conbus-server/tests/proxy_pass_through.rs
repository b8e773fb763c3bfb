//! The reverse proxy in front of the emulator.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use conbus_client::services::DiscoverService;
use conbus_client::{ConbusConnection, Pacing, ProtocolConfig};
use conbus_proto::{ModuleDefinition, Telegram};
use conbus_server::{BroadcastProxy, EmulatorConfig, EmulatorServer, ProxyConfig};

async fn start_stack() -> u16 {
    let emulator = EmulatorServer::bind(EmulatorConfig {
        bind_address: "127.0.0.1:0".to_owned(),
        definitions: vec![
            ModuleDefinition::bare("0020030837".parse().unwrap()),
            ModuleDefinition::bare("0020044966".parse().unwrap()),
        ],
        write_delay_min: Duration::from_millis(1),
        write_delay_max: Duration::from_millis(2),
        ..EmulatorConfig::default()
    })
    .await
    .unwrap();
    let upstream = emulator.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = emulator.run().await;
    });

    let proxy = BroadcastProxy::bind(ProxyConfig {
        bind_address: "127.0.0.1:0".to_owned(),
        upstream: upstream.to_string(),
        ..ProxyConfig::default()
    })
    .await
    .unwrap();
    let port = proxy.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = proxy.run().await;
    });
    port
}

fn client(port: u16, timeout: Duration) -> Rc<ConbusConnection> {
    ConbusConnection::new(ProtocolConfig {
        host: "127.0.0.1".to_owned(),
        port,
        timeout,
        pacing: Pacing::fixed(Duration::from_millis(2)),
        dedup_window: None,
    })
}

#[tokio::test]
async fn discovery_works_through_the_proxy() {
    let port = start_stack().await;

    let connection = client(port, Duration::from_millis(600));
    let response = DiscoverService::new(connection).run().await;

    assert!(response.exchange.success);
    assert_eq!(response.devices.len(), 2);
}

#[tokio::test]
async fn proxy_mirrors_upstream_traffic_to_other_observers() {
    let port = start_stack().await;

    let observer = client(port, Duration::from_millis(1_200));
    let seen = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&seen);
    observer.telegram_received.connect(move |_: &Telegram| counter.set(counter.get() + 1));

    let active = client(port, Duration::from_millis(500));
    let discover = DiscoverService::new(active);

    let (observer_result, response) = tokio::join!(observer.run(), Rc::clone(&discover).run());

    observer_result.unwrap();
    assert_eq!(response.devices.len(), 2);
    assert!(seen.get() >= 2, "observer sees mirrored bus traffic");
}
