mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{engine, init_tracing, loopback, pump_until, settle};
use netcore::network::{ConnectStatus, Connection, Connector, ConnectorState, TcpConnector};

type Statuses = Rc<RefCell<Vec<ConnectStatus>>>;

fn statuses() -> Statuses {
    Rc::new(RefCell::new(Vec::new()))
}

#[test]
fn test_engine_cancel_reports_canceled_once() {
    init_tracing();
    let server = engine();
    let client = engine();
    let address = server.listen(loopback()).unwrap();

    let seen = statuses();
    let sink = seen.clone();
    let connector = client.connect(address, move |connection, status| {
        assert!(connection.is_none());
        sink.borrow_mut().push(status);
    });
    assert_eq!(connector.state(), ConnectorState::Connecting);
    assert_eq!(client.connector_count(), 1);

    connector.cancel();
    assert_eq!(connector.state(), ConnectorState::Canceling);
    assert!(seen.borrow().is_empty());

    assert!(pump_until(&[&client], || !seen.borrow().is_empty()));
    connector.cancel();
    settle(&[&client, &server]);

    assert_eq!(*seen.borrow(), vec![ConnectStatus::Canceled]);
    assert_eq!(connector.state(), ConnectorState::Canceled);
    assert_eq!(client.connector_count(), 0);
    assert_eq!(client.connection_count(), 0);
}

#[test]
fn test_cancel_after_success_is_ignored() {
    init_tracing();
    let server = engine();
    let client = engine();
    let address = server.listen(loopback()).unwrap();

    let seen = statuses();
    let sink = seen.clone();
    let connector = client.connect(address, move |_, status| sink.borrow_mut().push(status));
    assert!(pump_until(&[&client, &server], || !seen.borrow().is_empty()));

    connector.cancel();
    settle(&[&client, &server]);
    assert_eq!(*seen.borrow(), vec![ConnectStatus::Success]);
    assert_eq!(connector.state(), ConnectorState::Connected);
    assert_eq!(client.connection_count(), 1);
}

#[test]
fn test_shutdown_cancels_pending_connects() {
    init_tracing();
    let server = engine();
    let client = engine();
    let address = server.listen(loopback()).unwrap();

    let seen = statuses();
    for _ in 0..3 {
        let sink = seen.clone();
        client.connect(address, move |_, status| sink.borrow_mut().push(status));
    }
    assert_eq!(client.connector_count(), 3);

    client.shutdown();
    assert!(pump_until(&[&client], || seen.borrow().len() == 3));
    assert!(seen.borrow().iter().all(|s| *s == ConnectStatus::Canceled));
    assert_eq!(client.connector_count(), 0);
}

#[test]
fn test_direct_connector_hands_over_connection() {
    init_tracing();
    let server = engine();
    let client = engine();
    let address = server.listen(loopback()).unwrap();

    let connector = TcpConnector::new(client.config());
    let outcome = Rc::new(RefCell::new(None));
    let sink = outcome.clone();
    assert!(connector.connect(
        client.reactor(),
        address,
        Box::new(move |connection, status| {
            *sink.borrow_mut() = Some((connection, status));
        }),
    ));
    assert!(outcome.borrow().is_none());

    assert!(pump_until(&[&client, &server], || outcome.borrow().is_some()));
    let (connection, status) = outcome.borrow_mut().take().unwrap();
    let connection = connection.unwrap();
    assert_eq!(status, ConnectStatus::Success);
    assert_eq!(connection.peer_addr(), address);
    assert_eq!(connector.state(), ConnectorState::Connected);

    // Connections from a standalone connector join the engine explicitly.
    client.register(connection.clone()).unwrap();
    assert_eq!(client.connection_count(), 1);
    assert!(client.register(connection).is_err());
}
