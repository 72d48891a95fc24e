use super::*;
use channel::MemoryChannel;
use shared::error::ErrorCode;
use std::time::Duration;

const TURN: Duration = Duration::from_millis(200);

struct Probe {
    core: Arc<ControllerCore>,
    seen: Mutex<Vec<Value>>,
}

impl Probe {
    fn new(context: ControllerContext) -> Self {
        Self {
            core: ControllerCore::new(&context),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<Value> {
        lock(&self.seen).clone()
    }

    async fn record(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let mut seen = lock(&self.seen);
        seen.push(inbound.data);
        Ok(json!({ "seen": seen.len() }))
    }

    async fn fail(self: Arc<Self>, _inbound: Inbound) -> Result<Value, DomainError> {
        Err(DomainError::new(ErrorCode::NotFound, "nothing here"))
    }

    async fn explode(self: Arc<Self>, _inbound: Inbound) -> Result<Value, DomainError> {
        panic!("handler bug")
    }

    async fn ask(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let reply = self
            .core
            .request_on(inbound.port, Event::GetRecipients, Value::Null)?
            .await?;
        Ok(reply)
    }
}

impl Controller for Probe {
    fn core(&self) -> &Arc<ControllerCore> {
        &self.core
    }

    fn register(table: &mut HandlerTable<Self>) -> Result<(), RouterError> {
        table
            .on(Event::SetArmored, Self::record)?
            .on(Event::DecryptMessage, Self::fail)?
            .on(Event::VerifyInlineSig, Self::explode)?
            .on(Event::EncryptMessage, Self::ask)?
            .on(Event::SignOnly, Self::fail)?
            .on(Event::SignOnly, Self::record)?;
        Ok(())
    }
}

fn probe() -> Arc<Probe> {
    start(Probe::new(ControllerContext::detached(
        ControllerKind::DecryptFrame,
        Services::default(),
    )))
    .expect("start")
}

fn bind(probe: &Arc<Probe>) -> EventHandler {
    let name = probe.core().name().to_string();
    let (ui, background) = channel::MemoryChannel::pair(&name, true);
    probe.core().attach(background).expect("attach");
    EventHandler::new(ui, name).expect("ui")
}

#[tokio::test]
async fn lifecycle_moves_from_unbound_to_active_to_closed() {
    let probe = probe();
    assert_eq!(probe.core().state(), Lifecycle::Unbound);

    let ui = bind(&probe);
    assert_eq!(probe.core().state(), Lifecycle::Active);

    ui.disconnect();
    tokio::time::timeout(TURN, probe.core().closed())
        .await
        .expect("closed in time");
    assert_eq!(probe.core().state(), Lifecycle::Closed);
    assert_eq!(probe.core().port_count(), 0);
}

#[tokio::test]
async fn notifications_are_handled_in_arrival_order() {
    let probe = probe();
    let ui = bind(&probe);

    for n in 0..10 {
        ui.emit(Event::SetArmored, json!({ "n": n })).expect("emit");
    }
    let reply = ui
        .send(Event::SetArmored, json!({ "n": 10 }))
        .expect("send")
        .await
        .expect("reply");

    assert_eq!(reply, json!({ "seen": 11 }));
    let order: Vec<Value> = probe.seen().into_iter().map(|data| data["n"].clone()).collect();
    assert_eq!(order, (0..=10).map(Value::from).collect::<Vec<_>>());
}

#[tokio::test]
async fn domain_errors_reject_requests_verbatim() {
    let probe = probe();
    let ui = bind(&probe);

    let err = ui
        .send(Event::DecryptMessage, Value::Null)
        .expect("send")
        .await
        .expect_err("handler fails");
    assert_eq!(
        err,
        RouterError::Remote(ReplyError::new("NOT_FOUND", "nothing here"))
    );
}

#[tokio::test]
async fn failed_notifications_are_reported_as_error_messages() {
    let probe = probe();
    let ui = bind(&probe);
    let mut errors = ui.subscribe(Event::ErrorMessage).expect("subscribe");

    ui.emit(Event::DecryptMessage, Value::Null).expect("emit");

    let report = tokio::time::timeout(TURN, errors.recv())
        .await
        .expect("in time")
        .expect("error-message");
    assert_eq!(report.data["event"], "decrypt-message");
    assert_eq!(report.data["error"]["type"], "NOT_FOUND");
}

#[tokio::test]
async fn a_panicking_handler_becomes_an_internal_error() {
    let probe = probe();
    let ui = bind(&probe);

    let err = ui
        .send(Event::VerifyInlineSig, Value::Null)
        .expect("send")
        .await
        .expect_err("panic reported");
    assert!(matches!(err, RouterError::Remote(reply) if reply.kind == "INTERNAL"));

    let after = ui
        .send(Event::SetArmored, json!({ "still": "alive" }))
        .expect("send")
        .await
        .expect("worker survived");
    assert_eq!(after, json!({ "seen": 1 }));
}

#[tokio::test]
async fn the_last_registration_for_an_event_wins() {
    let probe = probe();
    let ui = bind(&probe);

    let reply = ui
        .send(Event::SignOnly, json!({ "plaintext": "x" }))
        .expect("send")
        .await
        .expect("recorded");
    assert_eq!(reply, json!({ "seen": 1 }));
}

#[test]
fn empty_event_names_cannot_be_registered() {
    let mut table = HandlerTable::<Probe>::new();
    assert!(matches!(
        table.on(Event::Other(String::new()), Probe::record),
        Err(RouterError::InvalidArgument(_))
    ));
    assert!(table.events().is_empty());
}

#[tokio::test]
async fn handlers_can_await_their_own_requests_to_the_peer() {
    let probe = probe();
    let ui = bind(&probe);
    let responder = ui.clone();
    ui.on(Event::GetRecipients, move |envelope| {
        let id = envelope.id.clone().expect("request id");
        responder
            .reply(id, Event::GetRecipients, Ok(json!(["bob@example.org"])))
            .expect("reply");
    })
    .expect("subscribe");

    let reply = tokio::time::timeout(
        TURN,
        ui.send(Event::EncryptMessage, Value::Null).expect("send"),
    )
    .await
    .expect("in time")
    .expect("reply");
    assert_eq!(reply, json!(["bob@example.org"]));
}

#[tokio::test]
async fn later_envelopes_are_handled_while_a_handler_waits_on_its_peer() {
    let probe = probe();
    let ui = bind(&probe);
    let mut asked = ui.subscribe(Event::GetRecipients).expect("subscribe");

    let waiting = ui.send(Event::EncryptMessage, Value::Null).expect("send");
    let question = tokio::time::timeout(TURN, asked.recv())
        .await
        .expect("in time")
        .expect("get-recipients");

    let meanwhile = tokio::time::timeout(
        TURN,
        ui.send(Event::SetArmored, json!({ "n": 1 })).expect("send"),
    )
    .await
    .expect("answered while the first handler waits")
    .expect("reply");
    assert_eq!(meanwhile, json!({ "seen": 1 }));

    ui.reply(
        question.id.expect("request id"),
        Event::GetRecipients,
        Ok(json!(["carol@example.org"])),
    )
    .expect("reply");
    let answered = tokio::time::timeout(TURN, waiting)
        .await
        .expect("in time")
        .expect("reply");
    assert_eq!(answered, json!(["carol@example.org"]));
}

#[tokio::test]
async fn outstanding_requests_reject_when_the_peer_disconnects() {
    let probe = probe();
    let ui = bind(&probe);
    let mut asked = ui.subscribe(Event::GetRecipients).expect("subscribe");

    let first = probe
        .core()
        .request(Event::GetRecipients, Value::Null)
        .expect("request");
    let second = probe
        .core()
        .request(Event::GetRecipients, Value::Null)
        .expect("request");
    asked.recv().await.expect("delivered");
    asked.recv().await.expect("delivered");

    ui.disconnect();

    let name = probe.core().name().to_string();
    for pending in [first, second] {
        let outcome = tokio::time::timeout(TURN, pending).await.expect("in time");
        assert_eq!(outcome, Err(RouterError::ChannelClosed(name.clone())));
    }
}

#[tokio::test]
async fn emits_reach_every_port_and_the_last_port_closes_the_controller() {
    let probe = probe();
    let first = bind(&probe);
    let second = bind(&probe);
    assert_eq!(probe.core().port_count(), 2);
    let mut on_first = first.subscribe(Event::DecryptedMessage).expect("subscribe");
    let mut on_second = second.subscribe(Event::DecryptedMessage).expect("subscribe");

    probe
        .core()
        .emit(Event::DecryptedMessage, json!({ "plaintext": "hi" }))
        .expect("emit");
    assert_eq!(on_first.recv().await.expect("first").data["plaintext"], "hi");
    assert_eq!(on_second.recv().await.expect("second").data["plaintext"], "hi");

    first.disconnect();
    first.closed().await;
    tokio::task::yield_now().await;
    assert_eq!(probe.core().state(), Lifecycle::Active);

    second.disconnect();
    tokio::time::timeout(TURN, probe.core().closed())
        .await
        .expect("closed in time");
}

#[tokio::test]
async fn closing_a_controller_closes_adopted_children() {
    let parent = probe();
    let child = probe();
    parent.core().adopt(child.core());

    parent.core().close();

    assert!(child.core().is_closed());
    assert!(matches!(
        parent
            .core()
            .attach(MemoryChannel::pair("dFrame-late", true).1),
        Err(RouterError::ChannelClosed(_))
    ));
}

#[tokio::test]
async fn handles_downcast_to_their_concrete_controller() {
    let probe = probe();
    let handle = ControllerHandle::new(Arc::clone(&probe));
    assert!(handle.downcast::<Probe>().is_some());
    assert_eq!(handle.kind(), ControllerKind::DecryptFrame);
    assert!(handle.same_as(&handle.clone()));
}
