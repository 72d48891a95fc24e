//! The controller kinds served by the background context.

use std::collections::HashMap;

use messaging::RouterError;
use shared::domain::ControllerKind;

use crate::registry::{DuplicatePolicy, Registry};

mod app;
mod decrypt;
mod encrypt;
mod import;
mod key_gen;
mod main_cs;
mod menu;
mod password;
mod sync;
mod verify;

pub use app::AppController;
pub use decrypt::DecryptController;
pub use encrypt::{EncryptController, PRIMARY_KEY_PREF};
pub use import::ImportController;
pub use key_gen::KeyGenController;
pub use main_cs::MainContentController;
pub use menu::MenuController;
pub use password::PasswordController;
pub use sync::SyncController;
pub use verify::VerifyController;

/// Policy applied to a second connection under a live name.
///
/// Frames and the sync handler are reloaded in place, so the newest channel
/// wins. Dialogs answer exactly one prompt and refuse a second window.
/// Singleton surfaces share one controller across all their channels.
pub fn default_policy(kind: ControllerKind) -> DuplicatePolicy {
    match kind {
        ControllerKind::DecryptFrame
        | ControllerKind::EncryptFrame
        | ControllerKind::VerifyFrame
        | ControllerKind::ImportFrame
        | ControllerKind::SyncHandler => DuplicatePolicy::Replace,
        ControllerKind::PasswordDialog | ControllerKind::KeyGenDialog => {
            DuplicatePolicy::RejectDuplicate
        }
        ControllerKind::Menu | ControllerKind::App | ControllerKind::MainContentScript => {
            DuplicatePolicy::Reuse
        }
    }
}

/// Registers every kind, with `overrides` taking precedence over [`default_policy`].
pub fn register_all(
    registry: &Registry,
    overrides: &HashMap<ControllerKind, DuplicatePolicy>,
) -> Result<(), RouterError> {
    let policy = |kind: ControllerKind| {
        overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_policy(kind))
    };

    registry.register_controller(
        ControllerKind::DecryptFrame,
        policy(ControllerKind::DecryptFrame),
        DecryptController::new,
    )?;
    registry.register_controller(
        ControllerKind::EncryptFrame,
        policy(ControllerKind::EncryptFrame),
        EncryptController::new,
    )?;
    registry.register_controller(
        ControllerKind::VerifyFrame,
        policy(ControllerKind::VerifyFrame),
        VerifyController::new,
    )?;
    registry.register_controller(
        ControllerKind::ImportFrame,
        policy(ControllerKind::ImportFrame),
        ImportController::new,
    )?;
    registry.register_controller(
        ControllerKind::PasswordDialog,
        policy(ControllerKind::PasswordDialog),
        PasswordController::new,
    )?;
    registry.register_controller(
        ControllerKind::SyncHandler,
        policy(ControllerKind::SyncHandler),
        SyncController::new,
    )?;
    registry.register_controller(
        ControllerKind::Menu,
        policy(ControllerKind::Menu),
        MenuController::new,
    )?;
    registry.register_controller(
        ControllerKind::App,
        policy(ControllerKind::App),
        AppController::new,
    )?;
    registry.register_controller(
        ControllerKind::MainContentScript,
        policy(ControllerKind::MainContentScript),
        MainContentController::new,
    )?;
    registry.register_controller(
        ControllerKind::KeyGenDialog,
        policy(ControllerKind::KeyGenDialog),
        KeyGenController::new,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Services;

    #[test]
    fn every_kind_has_an_explicit_policy() {
        let registry = Registry::new(Services::default());
        register_all(&registry, &HashMap::new()).expect("register");
        for kind in ControllerKind::ALL {
            assert_eq!(registry.policy(*kind), Some(default_policy(*kind)));
        }
    }

    #[test]
    fn overrides_win_over_defaults() {
        let registry = Registry::new(Services::default());
        let overrides = HashMap::from([(ControllerKind::App, DuplicatePolicy::Replace)]);
        register_all(&registry, &overrides).expect("register");
        assert_eq!(
            registry.policy(ControllerKind::App),
            Some(DuplicatePolicy::Replace)
        );
    }

    #[test]
    fn registering_twice_is_a_duplicate_kind() {
        let registry = Registry::new(Services::default());
        register_all(&registry, &HashMap::new()).expect("register");
        assert_eq!(
            register_all(&registry, &HashMap::new()),
            Err(RouterError::DuplicateKind(ControllerKind::DecryptFrame))
        );
    }
}
