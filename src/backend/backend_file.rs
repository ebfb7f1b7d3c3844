use std::fs;
use std::path::{Path, PathBuf};

use log::{error, warn};

use crate::backend::FindError;

use crate::report::{ReportData, ReportKey, KEY_PREFIX};
use crate::user::User;

mod kv;

/// Storage key holding the entire account list as one JSON array.
pub const USERS_KEY: &str = "app_users";

#[derive(Debug)]
pub struct Backend {
    root: PathBuf,
}

impl Backend {
    pub async fn new(path: &Path) -> Result<Self, std::io::Error> {
        fs::create_dir_all(path)?;

        Ok(Self {
            root: path.to_path_buf(),
        })
    }
}

impl Backend {
    pub async fn users_raw(&self) -> Result<Option<String>, ()> {
        match kv::read(&self.root, USERS_KEY) {
            Ok(raw) => Ok(Some(raw)),
            Err(FindError::NotFound) => Ok(None),
            Err(FindError::Internal) => Err(()),
        }
    }

    pub async fn users(&self) -> Result<Vec<User>, ()> {
        Ok(match self.users_raw().await? {
            Some(raw) => parse_users(&raw),
            None => vec![],
        })
    }

    pub async fn write_users(&self, users: &[User]) -> Result<(), ()> {
        let json = serde_json::to_string(users).map_err(|e| {
            error!("couldn't encode users: {e}");
        })?;

        kv::write(&self.root, USERS_KEY, &json).map_err(|e| {
            error!("write \"{USERS_KEY}\": {e:?}");
        })
    }

    pub async fn find_user(&self, target_username: &str) -> Result<User, FindError> {
        let target = target_username.to_lowercase();

        self.users()
            .await
            .map_err(|()| FindError::Internal)?
            .into_iter()
            .find(|u| u.username.to_lowercase() == target)
            .ok_or(FindError::NotFound)
    }

    /// session_id: set to None to logout
    pub async fn update_user_session(&self, user_id: &str, session_id: Option<&str>) -> bool {
        let mut users = match self.users().await {
            Ok(u) => u,
            Err(()) => return false,
        };

        let Some(user) = users.iter_mut().find(|u| u.id == user_id) else {
            error!("no stored user with id {user_id}");
            return false;
        };

        user.session_id = session_id.map(|id| id.to_string());

        if let Err(()) = self.write_users(&users).await {
            error!("couldn't update session for {user_id}");
            false
        } else {
            true
        }
    }

    pub async fn users_with_session(&self, session_id: &str) -> Result<Vec<User>, ()> {
        Ok(self
            .users()
            .await?
            .into_iter()
            .filter(|u| u.session_id.as_deref() == Some(session_id))
            .collect())
    }
}

impl Backend {
    pub async fn report(&self, key: &ReportKey) -> Result<ReportData, FindError> {
        let raw = kv::read(&self.root, &key.to_string())?;

        let data: ReportData = serde_json::from_str(&raw).map_err(|e| {
            error!("couldn't parse report \"{key}\": {e}");
            FindError::Internal
        })?;

        if data.user_id != key.user_id() {
            error!(
                "report \"{key}\" claims owner {}, mismatching its key",
                data.user_id
            );
            return Err(FindError::Internal);
        }

        Ok(data)
    }

    pub async fn write_report(&self, key: &ReportKey, data: &ReportData) -> Result<(), ()> {
        let json = serde_json::to_string(data).map_err(|e| {
            error!("couldn't encode report \"{key}\": {e}");
        })?;

        kv::write(&self.root, &key.to_string(), &json).map_err(|e| {
            error!("write \"{key}\": {e:?}");
        })
    }

    pub async fn remove_report(&self, key: &ReportKey) -> Result<(), FindError> {
        kv::remove(&self.root, &key.to_string())
    }

    pub async fn report_keys(&self) -> Result<Vec<ReportKey>, ()> {
        let keys = kv::keys(&self.root).map_err(|e| {
            error!("couldn't scan \"{:?}\": {e:?}", self.root);
        })?;

        let mut parsed = vec![];

        for key in keys {
            if !key.starts_with(KEY_PREFIX) {
                continue;
            }

            match key.parse() {
                Ok(key) => parsed.push(key),
                Err(e) => warn!("skipping malformed report key \"{key}\": {e}"),
            }
        }

        Ok(parsed)
    }
}

fn parse_users(raw: &str) -> Vec<User> {
    match serde_json::from_str(raw) {
        Ok(users) => users,
        Err(e) => {
            error!("couldn't parse stored users: {e}");
            vec![]
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tempfile::TempDir;

    use crate::time::Timestamp;

    async fn create_backend(dir: &TempDir) -> Backend {
        Backend::new(dir.path()).await.unwrap()
    }

    fn demo_user() -> User {
        User {
            id: "user_demo_001".into(),
            username: "mario.rossi".into(),
            name: "Mario Rossi".into(),
            is_active: true,
            password: Some("password123".into()),
            session_id: None,
        }
    }

    #[tokio::test]
    async fn users_start_empty() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;

        assert_eq!(backend.users().await.unwrap(), vec![]);
        assert!(backend.users_raw().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn users_roundtrip() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;

        backend.write_users(&[demo_user()]).await.unwrap();
        assert_eq!(backend.users().await.unwrap(), vec![demo_user()]);
    }

    #[tokio::test]
    async fn corrupt_user_blob_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;

        fs::write(dir.path().join(USERS_KEY), "{not json").unwrap();
        assert_eq!(backend.users().await.unwrap(), vec![]);
    }

    #[tokio::test]
    async fn find_user_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;
        backend.write_users(&[demo_user()]).await.unwrap();

        let found = backend.find_user("Mario.Rossi").await.unwrap();
        assert_eq!(found.id, "user_demo_001");

        assert!(matches!(
            backend.find_user("giulia").await,
            Err(FindError::NotFound)
        ));
    }

    #[tokio::test]
    async fn session_update_sets_and_clears() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;
        backend.write_users(&[demo_user()]).await.unwrap();

        assert!(backend.update_user_session("user_demo_001", Some("sess")).await);
        let with_session = backend.users_with_session("sess").await.unwrap();
        assert_eq!(with_session.len(), 1);
        assert_eq!(with_session[0].id, "user_demo_001");

        assert!(backend.update_user_session("user_demo_001", None).await);
        assert_eq!(backend.users_with_session("sess").await.unwrap(), vec![]);

        assert!(!backend.update_user_session("nope", Some("sess")).await);
    }

    #[tokio::test]
    async fn reports_roundtrip_and_scan() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;

        let key = ReportKey::new("user_demo_001", Timestamp::from_millis(123));
        let data = ReportData {
            date: "2024-05-02".into(),
            text: "Report del 02/05/2024".into(),
            user_id: "user_demo_001".into(),
        };

        backend.write_report(&key, &data).await.unwrap();
        assert_eq!(backend.report(&key).await.unwrap(), data);
        assert_eq!(backend.report_keys().await.unwrap(), vec![key.clone()]);

        backend.remove_report(&key).await.unwrap();
        assert!(matches!(
            backend.report(&key).await,
            Err(FindError::NotFound)
        ));
        assert!(matches!(
            backend.remove_report(&key).await,
            Err(FindError::NotFound)
        ));
    }

    #[tokio::test]
    async fn scan_skips_foreign_and_malformed_keys() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;

        let key = ReportKey::new("u1", Timestamp::from_millis(1));
        backend
            .write_report(
                &key,
                &ReportData {
                    date: "2024-05-02".into(),
                    text: "x".into(),
                    user_id: "u1".into(),
                },
            )
            .await
            .unwrap();

        fs::write(dir.path().join(USERS_KEY), "[]").unwrap();
        fs::write(dir.path().join("dailyReport_nodigits"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(backend.report_keys().await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn owner_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;

        let key = ReportKey::new("u1", Timestamp::from_millis(1));
        fs::write(
            dir.path().join(key.to_string()),
            r#"{"date":"2024-05-02","text":"x","userId":"u2"}"#,
        )
        .unwrap();

        assert!(matches!(
            backend.report(&key).await,
            Err(FindError::Internal)
        ));
    }
}
