//! Domain models persisted by `db::*` and exchanged over the HTTP surface.

pub mod allowed_client;
pub mod auth_session;
pub mod device_code;
pub mod principal;
pub mod score_audit;
pub mod section_settings;
pub mod user_credential;
pub mod web_session;

pub use allowed_client::AllowedClient;
pub use auth_session::AuthorizationSession;
pub use device_code::{DeviceCode, DeviceCodeStatus};
pub use principal::Principal;
pub use score_audit::ScoreAuditRow;
pub use section_settings::SectionSettings;
pub use user_credential::UserCredential;
pub use web_session::WebSession;
