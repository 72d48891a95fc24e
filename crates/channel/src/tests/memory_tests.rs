use super::*;
use futures::StreamExt;
use serde_json::json;
use shared::protocol::Event;
use std::time::Duration;

fn envelope(n: u64) -> Envelope {
    Envelope::notification(Event::Other("tick".into()), json!({ "n": n }), "test-1")
}

#[tokio::test]
async fn delivers_in_send_order_to_the_peer_only() {
    let (connecting, accepting) = MemoryChannel::pair("test-1", true);
    let mut inbound = accepting.take_inbound().expect("inbound");
    for n in 0..50 {
        connecting.send(envelope(n)).expect("send");
    }
    for n in 0..50 {
        let received = inbound.next().await.expect("envelope");
        assert_eq!(received.data["n"], n);
    }

    let mut own = connecting.take_inbound().expect("own inbound");
    let nothing = tokio::time::timeout(Duration::from_millis(20), own.next()).await;
    assert!(nothing.is_err(), "sender must not observe its own envelopes");
}

#[tokio::test]
async fn disconnect_is_observed_by_both_ends() {
    let (connecting, accepting) = MemoryChannel::pair("test-1", true);
    let mut connecting_in = connecting.take_inbound().expect("inbound");
    let mut accepting_in = accepting.take_inbound().expect("inbound");
    let mut closed = accepting.closed();

    connecting.disconnect();

    assert!(connecting_in.next().await.is_none());
    assert!(accepting_in.next().await.is_none());
    closed.wait_for(|closed| *closed).await.expect("closed");
    assert!(!accepting.is_open());
}

#[tokio::test]
async fn send_after_disconnect_reports_closed() {
    let (connecting, accepting) = MemoryChannel::pair("test-1", true);
    accepting.disconnect();
    assert_eq!(
        connecting.send(envelope(1)),
        Err(ChannelError::Closed("test-1".into()))
    );
}

#[tokio::test]
async fn inbound_can_only_be_taken_once() {
    let (_connecting, accepting) = MemoryChannel::pair("test-1", true);
    assert!(accepting.take_inbound().is_ok());
    assert!(matches!(
        accepting.take_inbound(),
        Err(ChannelError::InboundTaken(_))
    ));
}

#[tokio::test]
async fn dropping_an_end_disconnects() {
    let (connecting, accepting) = MemoryChannel::pair("test-1", true);
    let mut inbound = accepting.take_inbound().expect("inbound");
    drop(connecting);
    assert!(inbound.next().await.is_none());
}

#[tokio::test]
async fn host_hands_accepting_end_to_listener() {
    let (host, mut incoming) = MemoryHost::new();
    let local = host.connect_memory("dFrame-abc").expect("connect");
    let remote = incoming.recv().await.expect("incoming");
    assert_eq!(remote.name(), "dFrame-abc");

    let mut inbound = remote.take_inbound().expect("inbound");
    local.send(envelope(7)).expect("send");
    assert_eq!(inbound.next().await.expect("envelope").data["n"], 7);
}

#[tokio::test]
async fn connect_without_listener_fails() {
    let (host, incoming) = MemoryHost::new();
    drop(incoming);
    assert!(matches!(
        host.connect("dFrame-abc"),
        Err(ChannelError::NoListener(_))
    ));
}

#[tokio::test]
async fn deferred_channel_reports_ready_after_mark() {
    let (host, mut incoming) = MemoryHost::new();
    let local = host.connect_deferred("eFrame-1").expect("connect");
    let remote = incoming.recv().await.expect("incoming");
    assert!(!*remote.ready().borrow());
    local.mark_ready();
    assert!(*remote.ready().borrow());
}

#[tokio::test]
async fn surface_requests_reach_subscribers() {
    let (host, _incoming) = MemoryHost::new();
    let mut surfaces = host.subscribe_surfaces();
    let name = shared::domain::EndpointName::parse("pwdDialog-1").expect("name");
    host.open_surface(&name).await.expect("open");
    assert_eq!(surfaces.recv().await.expect("surface"), name);
}
