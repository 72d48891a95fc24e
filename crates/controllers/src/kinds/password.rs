use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use messaging::RouterError;
use serde_json::Value;
use shared::{
    domain::ControllerKind,
    error::{DomainError, ErrorCode},
    protocol::{Event, KeyRecord, PasswordAnswer, PasswordPrompt},
};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::{
    controller::{lock, Controller, ControllerContext, ControllerCore, HandlerTable, Inbound},
    registry::WeakRegistry,
    services::Services,
};

type Answer = oneshot::Sender<Result<String, DomainError>>;

fn cancelled(message: &str) -> DomainError {
    DomainError::new(ErrorCode::PwdDialogCancel, message)
}

/// Backs one password dialog surface and answers the controller that opened it.
pub struct PasswordController {
    core: Arc<ControllerCore>,
    services: Services,
    prompt: Mutex<Option<PasswordPrompt>>,
    answer: Arc<Mutex<Option<Answer>>>,
    watching: AtomicBool,
}

impl PasswordController {
    pub fn new(context: ControllerContext) -> Self {
        Self {
            core: ControllerCore::new(&context),
            services: context.services,
            prompt: Mutex::new(None),
            answer: Arc::new(Mutex::new(None)),
            watching: AtomicBool::new(false),
        }
    }

    /// Arms the dialog with `prompt`; the receiver resolves with the entered
    /// password, or with `PWD_DIALOG_CANCEL` once the dialog goes away unanswered.
    pub fn prompt(&self, prompt: PasswordPrompt) -> oneshot::Receiver<Result<String, DomainError>> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.prompt) = Some(prompt);
        if let Some(previous) = lock(&self.answer).replace(tx) {
            let _ = previous.send(Err(cancelled("superseded by a newer prompt")));
        }

        if self.watching.swap(true, Ordering::AcqRel) {
            return rx;
        }
        // One watcher per dialog answers whichever prompt is pending when it closes.
        let core = Arc::clone(&self.core);
        let answer = Arc::clone(&self.answer);
        tokio::spawn(async move {
            core.closed().await;
            if let Some(pending) = lock(&answer).take() {
                debug!(endpoint = %core.name(), "dialog closed without an answer");
                let _ = pending.send(Err(cancelled("password dialog closed")));
            }
        });
        rx
    }

    fn resolve(&self, outcome: Result<String, DomainError>) -> Result<(), DomainError> {
        let pending = lock(&self.answer)
            .take()
            .ok_or_else(|| DomainError::invalid("no password request is pending"))?;
        let _ = pending.send(outcome);
        Ok(())
    }

    async fn init(self: Arc<Self>, _inbound: Inbound) -> Result<Value, DomainError> {
        let prompt = lock(&self.prompt)
            .clone()
            .ok_or_else(|| DomainError::new(ErrorCode::NotFound, "dialog has no prompt"))?;
        Ok(serde_json::to_value(prompt)?)
    }

    async fn ok(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        let PasswordAnswer { password, cache } = inbound.payload()?;
        if password.is_empty() {
            return Err(DomainError::invalid("password must not be empty"));
        }
        let fingerprint = lock(&self.prompt)
            .as_ref()
            .map(|prompt| prompt.fingerprint.clone());
        if let (true, Some(fingerprint)) = (cache, fingerprint) {
            self.services.passwords.set(fingerprint, password.clone());
        }
        self.resolve(Ok(password))?;
        self.core.emit_on(inbound.port, Event::CloseDialog, Value::Null)?;
        Ok(Value::Null)
    }

    async fn cancel(self: Arc<Self>, inbound: Inbound) -> Result<Value, DomainError> {
        self.resolve(Err(cancelled("password entry cancelled")))?;
        self.core.emit_on(inbound.port, Event::CloseDialog, Value::Null)?;
        Ok(Value::Null)
    }
}

impl Controller for PasswordController {
    fn core(&self) -> &Arc<ControllerCore> {
        &self.core
    }

    fn register(table: &mut HandlerTable<Self>) -> Result<(), RouterError> {
        table
            .on(Event::PwdDialogInit, Self::init)?
            .on(Event::PwdDialogOk, Self::ok)?
            .on(Event::PwdDialogCancel, Self::cancel)?;
        Ok(())
    }
}

/// Returns the password for `key`, from the cache or by opening a password dialog.
///
/// The dialog endpoint is pre-registered before the surface is opened and is
/// closed together with `owner`.
pub(crate) async fn request_password(
    owner: &ControllerCore,
    services: &Services,
    registry: &WeakRegistry,
    key: &KeyRecord,
    reason: &str,
) -> Result<String, DomainError> {
    if let Some(password) = services.passwords.get(&key.fingerprint) {
        return Ok(password);
    }

    let registry = registry
        .upgrade()
        .ok_or_else(|| DomainError::new(ErrorCode::Unavailable, "registry is shutting down"))?;
    let child = registry.spawn(ControllerKind::PasswordDialog)?;
    let dialog = child
        .downcast::<PasswordController>()
        .ok_or_else(|| DomainError::internal("password dialog kind built another controller"))?;
    owner.adopt(child.core());

    let answer = dialog.prompt(PasswordPrompt {
        fingerprint: key.fingerprint.clone(),
        user_id: key.user_ids.first().cloned().unwrap_or_default(),
        reason: reason.to_string(),
    });
    drop(dialog);

    info!(endpoint = %owner.name(), dialog = %child.name(), fingerprint = %key.fingerprint, "asking for password");
    if let Err(err) = services.surfaces.open_surface(child.name()).await {
        child.core().close();
        return Err(DomainError::new(
            ErrorCode::Unavailable,
            format!("could not open password dialog: {err:#}"),
        ));
    }

    answer
        .await
        .unwrap_or_else(|_| Err(cancelled("password dialog went away")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use channel::MemoryChannel;
    use messaging::EventHandler;
    use serde_json::json;
    use shared::domain::Fingerprint;

    use super::*;
    use crate::controller::start;

    fn prompt() -> PasswordPrompt {
        PasswordPrompt {
            fingerprint: Fingerprint::from("F00D"),
            user_id: "alice@example.org".into(),
            reason: "decrypt".into(),
        }
    }

    fn open_dialog(services: Services) -> (Arc<PasswordController>, EventHandler) {
        let dialog = start(PasswordController::new(ControllerContext::detached(
            ControllerKind::PasswordDialog,
            services,
        )))
        .expect("start");
        let name = dialog.core().name().to_string();
        let (ui, background) = MemoryChannel::pair(&name, true);
        dialog.core().attach(background).expect("attach");
        let ui = EventHandler::new(ui, name).expect("ui");
        (dialog, ui)
    }

    #[tokio::test]
    async fn ok_resolves_the_prompt_and_caches_on_request() {
        let services = Services::default();
        let (dialog, ui) = open_dialog(services.clone());
        let answer = dialog.prompt(prompt());
        let mut close = ui.subscribe(Event::CloseDialog).expect("subscribe");

        let shown = ui
            .send(Event::PwdDialogInit, Value::Null)
            .expect("send")
            .await
            .expect("prompt");
        assert_eq!(shown["fingerprint"], "F00D");

        ui.send(Event::PwdDialogOk, json!({ "password": "pw", "cache": true }))
            .expect("send")
            .await
            .expect("ok");

        assert_eq!(answer.await.expect("answer"), Ok("pw".to_string()));
        assert_eq!(
            services.passwords.get(&Fingerprint::from("F00D")).as_deref(),
            Some("pw")
        );
        close.recv().await.expect("close-dialog");
    }

    #[tokio::test]
    async fn cancel_rejects_the_prompt() {
        let (dialog, ui) = open_dialog(Services::default());
        let answer = dialog.prompt(prompt());

        ui.emit(Event::PwdDialogCancel, Value::Null).expect("emit");

        let err = answer.await.expect("answer").expect_err("cancelled");
        assert_eq!(err.code, ErrorCode::PwdDialogCancel);
    }

    #[tokio::test]
    async fn closing_the_dialog_cancels_the_prompt() {
        let (dialog, ui) = open_dialog(Services::default());
        let answer = dialog.prompt(prompt());

        ui.disconnect();

        let err = tokio::time::timeout(Duration::from_millis(200), answer)
            .await
            .expect("in time")
            .expect("answer")
            .expect_err("cancelled");
        assert_eq!(err.code, ErrorCode::PwdDialogCancel);
        assert!(dialog.core().is_closed());
    }

    #[tokio::test]
    async fn repeated_prompts_share_one_close_watcher() {
        let (dialog, ui) = open_dialog(Services::default());
        let metrics = tokio::runtime::Handle::current().metrics();

        let first = dialog.prompt(prompt());
        let alive = metrics.num_alive_tasks();
        let second = dialog.prompt(prompt());
        let third = dialog.prompt(prompt());
        assert_eq!(metrics.num_alive_tasks(), alive);

        let superseded = first.await.expect("answer").expect_err("superseded");
        assert_eq!(superseded.code, ErrorCode::PwdDialogCancel);
        assert!(second.await.expect("answer").is_err());

        ui.disconnect();
        let err = tokio::time::timeout(Duration::from_millis(200), third)
            .await
            .expect("in time")
            .expect("answer")
            .expect_err("cancelled on close");
        assert_eq!(err.code, ErrorCode::PwdDialogCancel);
    }

    #[tokio::test]
    async fn ok_without_a_prompt_is_rejected() {
        let (_dialog, ui) = open_dialog(Services::default());
        let err = ui
            .send(Event::PwdDialogOk, json!({ "password": "pw" }))
            .expect("send")
            .await
            .expect_err("nothing pending");
        assert!(matches!(err, RouterError::Remote(reply) if reply.kind == "INVALID_ARGUMENT"));
    }
}
