use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, FixedOffset, Utc};
use rand::prelude::*;
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, sync::Arc};
use tracing::{info, warn};

use crate::analytics::{AnalyticsReport, DateFilter};
use crate::builder::EditorSessions;
use crate::error::{self, Error};
use crate::export;
use crate::kiosk::{AdminAccess, KioskController};
use crate::models::{Seed, Survey};
use crate::store::Store;

/// How long an admin token stays valid.
const ADMIN_TOKEN_HOURS: i64 = 12;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AdminSession {
    pub nonce: [u8; 16],
    pub issued_at: i64,
    pub survey_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AdminRequest {
    pub password: Option<String>,
    /// Set when the operator confirmed entry to an unprotected kiosk.
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct AdminReply {
    pub access: AdminAccess,
    pub token: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SurveyController {
    secret_key: Arc<hmac::Key>,
    store: Store,
    kiosk: KioskController,
    editors: EditorSessions,
    offset: FixedOffset,
}

impl SurveyController {
    pub fn new(secret_key: hmac::Key, store: Store, offset: FixedOffset) -> SurveyController {
        let kiosk = KioskController::new(store.clone());

        SurveyController {
            secret_key: Arc::new(secret_key),
            store,
            kiosk,
            editors: EditorSessions::default(),
            offset,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn kiosk(&self) -> &KioskController {
        &self.kiosk
    }

    pub fn editors(&self) -> &EditorSessions {
        &self.editors
    }

    pub fn offset(&self) -> &FixedOffset {
        &self.offset
    }

    /// Admin routes are open until a master password is set.
    pub fn requires_admin(&self) -> bool {
        self.store.has_master_password()
    }

    pub fn create_admin(&self, survey_id: Option<String>) -> AdminSession {
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill(&mut nonce);

        AdminSession {
            nonce,
            issued_at: Utc::now().timestamp(),
            survey_id,
        }
    }

    pub fn encode_admin(&self, session: &AdminSession) -> Result<String> {
        let session = bincode::serialize(session)?;

        let signature = hmac::sign(&self.secret_key, &session);

        let token = format!(
            "{}:{}",
            URL_SAFE_NO_PAD.encode(session),
            URL_SAFE_NO_PAD.encode(signature),
        );

        Ok(token)
    }

    pub fn decode_admin(&self, token: &str) -> Result<AdminSession> {
        let mut parts = token.splitn(2, ':');
        let session = parts
            .next()
            .ok_or_else(|| anyhow!("bad admin token"))?;
        let session = URL_SAFE_NO_PAD.decode(session)?;

        let signature = parts
            .next()
            .ok_or_else(|| anyhow!("bad admin token"))?;
        let signature = URL_SAFE_NO_PAD.decode(signature)?;

        hmac::verify(&self.secret_key, &session, &signature)
            .map_err(|_err| anyhow!("invalid signature"))?;

        let session: AdminSession = bincode::deserialize(&session)?;

        let expires = session.issued_at + Duration::hours(ADMIN_TOKEN_HOURS).num_seconds();
        if expires < Utc::now().timestamp() {
            return Err(anyhow!("admin token expired"));
        }

        Ok(session)
    }

    /// Runs the kiosk's password challenge and hands out a token on success.
    pub async fn admin_login(&self, request: &AdminRequest) -> error::Result<AdminReply> {
        let access = match self.kiosk.admin_access(request.password.as_deref()).await {
            AdminAccess::NeedsConfirmation if request.confirm => AdminAccess::Granted,
            AdminAccess::Denied => return Err(Error::Unauthorized),
            access => access,
        };

        let token = match access {
            AdminAccess::Granted => {
                let session = self.create_admin(self.kiosk.active_survey().await);
                let token = self.encode_admin(&session).map_err(|err| {
                    warn!("Couldn't encode admin token: {}", err);
                    Error::Unauthorized
                })?;
                Some(token)
            }
            _ => None,
        };

        Ok(AdminReply { access, token })
    }

    pub fn analytics(&self, id: &str, filter: DateFilter) -> error::Result<AnalyticsReport> {
        let survey = self
            .store
            .survey(id)
            .ok_or_else(|| Error::NotFound(id.into()))?;
        let responses = self.store.responses(id);

        Ok(AnalyticsReport::build(&survey, &responses, filter, &self.offset))
    }

    pub fn import(&self, raw: &str) -> error::Result<Survey> {
        Ok(export::import_survey(&self.store, raw, Utc::now())?)
    }

    /// Imports the seed surveys, but only into an empty store.
    pub fn seed(&self, seeds: &[Seed]) -> Result<usize> {
        if seeds.is_empty() || !self.store.surveys().is_empty() {
            return Ok(0);
        }

        let mut imported = 0;
        for seed in seeds {
            match self.import_file(&seed.path) {
                Ok(survey) => {
                    info!("Seeded {} from {}", survey.title, seed.path.display());
                    imported += 1;
                }
                Err(err) => warn!("Skipping seed {}: {}", seed.path.display(), err),
            }
        }

        Ok(imported)
    }

    fn import_file(&self, path: &Path) -> Result<Survey> {
        let raw = fs::read_to_string(path)?;
        Ok(self.import(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use chrono::Offset;

    fn controller() -> SurveyController {
        let key = hmac::Key::new(hmac::HMAC_SHA256, b"0123456789abcdef0123456789abcdef");
        SurveyController::new(key, Store::in_memory(), Utc.fix())
    }

    #[test]
    fn admin_token_round_trips() {
        let controller = controller();
        let session = controller.create_admin(Some("s1".into()));

        let token = controller.encode_admin(&session).unwrap();
        assert_eq!(controller.decode_admin(&token).unwrap(), session);
    }

    #[test]
    fn tampered_or_foreign_tokens_are_rejected() {
        let controller = controller();
        let token = controller
            .encode_admin(&controller.create_admin(None))
            .unwrap();

        let (payload, signature) = token.split_once(':').unwrap();
        let forged = controller
            .encode_admin(&controller.create_admin(Some("other".into())))
            .unwrap();
        let (forged_payload, _) = forged.split_once(':').unwrap();

        assert!(controller
            .decode_admin(&format!("{}:{}", forged_payload, signature))
            .is_err());
        assert!(controller.decode_admin(payload).is_err());
        assert!(controller.decode_admin("garbage").is_err());

        let other = SurveyController::new(
            hmac::Key::new(hmac::HMAC_SHA256, b"another key entirely............"),
            Store::in_memory(),
            Utc.fix(),
        );
        assert!(other.decode_admin(&token).is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let controller = controller();
        let mut session = controller.create_admin(None);
        session.issued_at -= Duration::hours(ADMIN_TOKEN_HOURS + 1).num_seconds();

        let token = controller.encode_admin(&session).unwrap();
        assert!(controller.decode_admin(&token).is_err());
    }

    #[tokio::test]
    async fn admin_login_outcomes() {
        let controller = controller();

        let reply = controller.admin_login(&AdminRequest::default()).await.unwrap();
        assert_eq!(reply.access, AdminAccess::NeedsConfirmation);
        assert!(reply.token.is_none());

        let reply = controller
            .admin_login(&AdminRequest {
                password: None,
                confirm: true,
            })
            .await
            .unwrap();
        assert_eq!(reply.access, AdminAccess::Granted);
        assert!(controller.decode_admin(&reply.token.unwrap()).is_ok());

        controller.store().set_master_password("master").unwrap();
        let denied = controller
            .admin_login(&AdminRequest {
                password: Some("wrong".into()),
                confirm: true,
            })
            .await;
        assert!(matches!(denied, Err(Error::Unauthorized)));
        assert!(controller.requires_admin());
    }

    #[test]
    fn analytics_for_missing_survey_is_not_found() {
        let controller = controller();
        assert!(matches!(
            controller.analytics("nope", DateFilter::default()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn seeds_import_only_into_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");
        fs::write(
            &path,
            r#"{"version":"1.0","survey":{"title":"Seeded","questions":[{"type":"yesNo","question":"Ok?"}]}}"#,
        )
        .unwrap();
        let seeds = vec![
            Seed { path: path.clone() },
            Seed {
                path: dir.path().join("missing.json"),
            },
        ];

        let seeded = controller();
        assert_eq!(seeded.seed(&seeds).unwrap(), 1);
        assert_eq!(seeded.store().surveys()[0].title, "Seeded (Imported)");

        assert_eq!(seeded.seed(&seeds).unwrap(), 0);
        assert_eq!(seeded.store().surveys().len(), 1);

        let other = controller();
        other.store().save_survey(&fixtures::survey("s1")).unwrap();
        assert_eq!(other.seed(&seeds).unwrap(), 0);
    }
}
