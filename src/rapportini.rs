use std::collections::HashMap;
use std::result;
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, error, info, trace};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use warp::http;

use crate::auth::{Credentials, SessionId};
use crate::backend::{Backend, FindError};
use crate::doc;
use crate::report::{self, Report, ReportData, ReportKey};
use crate::time::Timestamp;
use crate::user::{User, UserInfo, UserUpdate};

pub const MASTER_USERNAME: &str = "master";
pub const MASTER_PASSWORD: &str = "Masterpass";

const MASTER_ID: &str = "master001";
const DEMO_ID: &str = "user_demo_001";
const DEMO_USERNAME: &str = "mario.rossi";
const DEMO_PASSWORD: &str = "password123";

const REPORT_WINDOW_DAYS: i64 = 30;
const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug)]
pub struct Rapportini(Backend);

#[derive(Debug)]
pub struct RapportiniAuthed<const MASTER: bool = false> {
    app: Arc<Rapportini>,
    session_id: SessionId,
    user: User,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    Internal,
    Unauthorized,
    BadRequest,
    NotFound,
    Conflict,
}

pub type Result<T> = result::Result<T, Error>;

impl Into<http::StatusCode> for Error {
    fn into(self) -> http::StatusCode {
        match self {
            Self::Internal => http::StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unauthorized => http::StatusCode::UNAUTHORIZED,
            Self::BadRequest => http::StatusCode::BAD_REQUEST,
            Self::NotFound => http::StatusCode::NOT_FOUND,
            Self::Conflict => http::StatusCode::CONFLICT,
        }
    }
}

impl Error {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Internal => "Si è verificato un errore.",
            Self::Unauthorized => "Non autorizzato.",
            Self::BadRequest => "Richiesta non valida.",
            Self::NotFound => "Elemento non trovato.",
            Self::Conflict => "Esiste già un report salvato per questa data.",
        }
    }
}

impl warp::reject::Reject for Error {}

/// Why a login attempt was turned away. `reason` is the wire-level code,
/// `message` the fixed text shown to the user.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoginFailure {
    Unauthorized,
    Disabled,
    InvalidCredentials,
    Other,
    MasterPassword,
    MasterAccount,
}

impl LoginFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Disabled => "disabled",
            Self::InvalidCredentials | Self::MasterPassword => "invalid_credentials",
            Self::Other | Self::MasterAccount => "other",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Utente non trovato o non autorizzato.",
            Self::Disabled => "Il tuo account è stato disabilitato.",
            Self::InvalidCredentials => "Credenziali non valide.",
            Self::Other => "Si è verificato un errore durante il login.",
            Self::MasterPassword => "Password errata.",
            Self::MasterAccount => "Errore di login master. Contattare l'assistenza.",
        }
    }
}

impl warp::reject::Reject for LoginFailure {}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddUserError {
    MissingUsername,
    UsernameTaken,
    WeakPassword,
    Internal,
}

impl AddUserError {
    pub fn status(&self) -> http::StatusCode {
        match self {
            Self::MissingUsername | Self::WeakPassword => http::StatusCode::BAD_REQUEST,
            Self::UsernameTaken => http::StatusCode::CONFLICT,
            Self::Internal => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::MissingUsername => "Il nome utente è obbligatorio.",
            Self::UsernameTaken => "Questo nome utente esiste già.",
            Self::WeakPassword => {
                "La password è obbligatoria e deve essere di almeno 6 caratteri."
            }
            Self::Internal => "Si è verificato un errore.",
        }
    }
}

impl warp::reject::Reject for AddUserError {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
}

/// One accordion entry of the master list view: an owner and their
/// reports in the window.
#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportGroup {
    pub user_id: String,
    pub user_name: String,
    pub reports: Vec<Report>,
}

impl Rapportini {
    pub fn new(backend: Backend) -> Self {
        Self(backend)
    }

    /// One-time startup initialization: drop the legacy email-era records
    /// wholesale, then make sure the built-in master and demo accounts
    /// exist. Writes back only when something changed, so re-running is a
    /// no-op.
    pub async fn bootstrap_users(&self) -> Result<()> {
        let mut users = match self.0.users_raw().await.map_err(|()| Error::Internal)? {
            Some(raw) => parse_stored_users(&raw),
            None => vec![],
        };

        let mut updated = false;

        if !users.iter().any(|u| u.username == MASTER_USERNAME) {
            users.push(User {
                id: MASTER_ID.into(),
                username: MASTER_USERNAME.into(),
                name: "Admin".into(),
                is_active: true,
                password: None,
                session_id: None,
            });
            updated = true;
        }

        match users.iter_mut().find(|u| u.username == DEMO_USERNAME) {
            None => {
                users.push(User {
                    id: DEMO_ID.into(),
                    username: DEMO_USERNAME.into(),
                    name: "Mario Rossi".into(),
                    is_active: true,
                    password: Some(DEMO_PASSWORD.into()),
                    session_id: None,
                });
                updated = true;
            }
            Some(demo) if demo.password.is_none() => {
                demo.password = Some(DEMO_PASSWORD.into());
                updated = true;
            }
            Some(_) => {}
        }

        if updated {
            info!("seeding built-in accounts");
            self.0
                .write_users(&users)
                .await
                .map_err(|()| Error::Internal)?;
        }

        Ok(())
    }

    pub async fn login(
        self: &Arc<Self>,
        creds: Credentials,
        client_session_id: Option<SessionId>,
    ) -> result::Result<RapportiniAuthed, LoginFailure> {
        let username = creds.user();

        let user = self.0.find_user(username).await.map_err(|e| {
            if matches!(e, FindError::NotFound) {
                error!("rejecting non-existant user {}", username);
                LoginFailure::Unauthorized
            } else {
                error!("couldn't authenticate user {}: {e:?}", username);
                LoginFailure::Other
            }
        })?;

        if !user.is_active {
            info!("{username} login rejected: account disabled");
            return Err(LoginFailure::Disabled);
        }

        match user.password.as_deref() {
            Some(stored) if stored == creds.pass() => {}
            _ => {
                error!("wrong password for user {}", username);
                return Err(LoginFailure::InvalidCredentials);
            }
        }

        self.establish_session(user, client_session_id).await
    }

    /// The shared-password bypass into the privileged role. Anything that
    /// keeps a correct password out of the master account is reported as
    /// the master-assistance failure.
    pub async fn login_master(
        self: &Arc<Self>,
        password: &str,
        client_session_id: Option<SessionId>,
    ) -> result::Result<RapportiniAuthed, LoginFailure> {
        if password != MASTER_PASSWORD {
            error!("wrong master password");
            return Err(LoginFailure::MasterPassword);
        }

        let user = self.0.find_user(MASTER_USERNAME).await.map_err(|e| {
            error!("couldn't look up the master account: {e:?}");
            LoginFailure::MasterAccount
        })?;

        if !user.is_active {
            info!("master login rejected: account disabled");
            return Err(LoginFailure::MasterAccount);
        }

        self.establish_session(user, client_session_id)
            .await
            .map_err(|_| LoginFailure::MasterAccount)
    }

    async fn establish_session(
        self: &Arc<Self>,
        user: User,
        client_session_id: Option<SessionId>,
    ) -> result::Result<RapportiniAuthed, LoginFailure> {
        let username = user.username.clone();

        let db_session_id = match user.session_id {
            Some(ref id) => {
                let session_id = SessionId::from_str(id).map_err(|()| {
                    error!("invalid stored session_id: {:?}", user.session_id);
                    LoginFailure::Other
                })?;
                Some(session_id)
            }
            None => None,
        };

        let ok = |session_id, user| {
            Ok(RapportiniAuthed {
                app: Arc::clone(self),
                session_id,
                user,
            })
        };

        match (client_session_id, db_session_id) {
            (None, None) => {
                // initial login
                let session_id = SessionId::new();
                let session_id_str = session_id.to_string();

                if !self
                    .0
                    .update_user_session(&user.id, Some(&session_id_str))
                    .await
                {
                    error!("couldn't login user {}", username);
                    return Err(LoginFailure::Other);
                }

                info!("{username} login: new session created");
                let user = User {
                    session_id: Some(session_id_str),
                    ..user
                };
                ok(session_id, user)
            }
            (Some(client), Some(db_id)) => {
                if client == db_id {
                    info!("{username} login: session check passed");
                    ok(client, user)
                } else {
                    info!("{username} login: session check failed");
                    Err(LoginFailure::Other)
                }
            }
            (Some(_), None) => {
                // logged out but somehow kept their token?
                info!("{username} login: no session in storage");
                Err(LoginFailure::Unauthorized)
            }
            (None, Some(db_id)) => {
                // logging in again, client's forgot their token
                info!("{username} login: fresh login");
                ok(db_id, user)
            }
        }
    }

    pub async fn authenticate(self: &Arc<Self>, session_id: SessionId) -> Result<RapportiniAuthed> {
        let session_str = session_id.to_string();

        let mut users = self
            .0
            .users_with_session(&session_str)
            .await
            .map_err(|()| Error::Internal)?;

        match users.len() {
            0 => {
                error!("no user found for session {session_id}");
                Err(Error::Unauthorized)
            }
            1 => {
                let user = users.remove(0);
                assert_eq!(user.session_id.as_deref(), Some(session_str.as_str()));

                if !user.is_active {
                    info!("{} session rejected: account disabled", user.username);
                    return Err(Error::Unauthorized);
                }

                debug!("found {} by session", user.username);
                Ok(RapportiniAuthed {
                    app: Arc::clone(self),
                    session_id,
                    user,
                })
            }
            _ => {
                error!("multiple users found for session {session_id}");
                Err(Error::Internal)
            }
        }
    }

    /// Scan every report entry, keeping `owner`'s (or everyone's, for
    /// `None`) that fall inside the listing window. Corrupt entries are
    /// logged and skipped. Newest first, creation time breaking ties.
    async fn collect_reports(&self, owner: Option<&str>) -> Result<Vec<Report>> {
        let keys = self.0.report_keys().await.map_err(|()| Error::Internal)?;

        let cutoff = OffsetDateTime::now_utc().date() - Duration::days(REPORT_WINDOW_DAYS);
        let mut reports = vec![];

        for key in keys {
            if let Some(owner) = owner {
                if key.user_id() != owner {
                    continue;
                }
            }

            let data = match self.0.report(&key).await {
                Ok(data) => data,
                Err(e) => {
                    error!("couldn't read report \"{key}\": {e:?}");
                    continue;
                }
            };

            let date = match report::parse_date(&data.date) {
                Ok(date) => date,
                Err(e) => {
                    error!("couldn't parse date of report \"{key}\": {e}");
                    continue;
                }
            };

            if date < cutoff {
                continue;
            }

            reports.push((date, key.created(), Report::from_stored(&key, data)));
        }

        reports.sort_by(|(date_a, created_a, _), (date_b, created_b, _)| {
            (date_b, created_b).cmp(&(date_a, created_a))
        });

        Ok(reports.into_iter().map(|(_, _, report)| report).collect())
    }

    /// Does `user_id` already have a report on `date`'s calendar day?
    /// `excluding` names the report currently being edited, which doesn't
    /// count against itself.
    async fn date_conflict(
        &self,
        user_id: &str,
        date: &str,
        excluding: Option<&ReportKey>,
    ) -> Result<Option<ReportKey>> {
        let keys = self.0.report_keys().await.map_err(|()| Error::Internal)?;

        for key in keys {
            if key.user_id() != user_id || excluding == Some(&key) {
                continue;
            }

            let data = match self.0.report(&key).await {
                Ok(data) => data,
                Err(e) => {
                    error!("couldn't read report \"{key}\" checking for a date conflict: {e:?}");
                    continue;
                }
            };

            if report::same_day(&data.date, date) {
                return Ok(Some(key));
            }
        }

        Ok(None)
    }
}

impl RapportiniAuthed {
    pub fn require_master(self) -> Result<RapportiniAuthed<true>> {
        if self.is_master() {
            Ok(RapportiniAuthed {
                app: self.app,
                session_id: self.session_id,
                user: self.user,
            })
        } else {
            error!("{} is not the master account", self.user.username);
            Err(Error::Unauthorized)
        }
    }
}

impl<const MASTER: bool> RapportiniAuthed<MASTER> {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn info(&self) -> UserInfo {
        UserInfo::from(&self.user)
    }

    pub fn is_master(&self) -> bool {
        self.user.username == MASTER_USERNAME
    }

    pub async fn logout(&self) -> Result<()> {
        let username = &self.user.username;
        info!("{username} logout");

        self.app
            .0
            .update_user_session(&self.user.id, None)
            .await
            .then(|| ())
            .ok_or(Error::Internal)
    }

    pub async fn reports(&self) -> Result<Vec<Report>> {
        let username = &self.user.username;
        trace!("{username} listing reports");

        let owner = if self.is_master() {
            None
        } else {
            Some(self.user.id.as_str())
        };

        let reports = self.app.collect_reports(owner).await?;
        info!("{username}, {} reports", reports.len());
        Ok(reports)
    }

    pub async fn create_report(&self, date: &str, text: &str) -> Result<Report> {
        let username = &self.user.username;

        report::parse_date(date).map_err(|e| {
            error!("{username} submitted an unusable date {date:?}: {e}");
            Error::BadRequest
        })?;

        if let Some(existing) = self.app.date_conflict(&self.user.id, date, None).await? {
            info!(
                "{username} already has report \"{existing}\" on {}",
                report::date_part(date)
            );
            return Err(Error::Conflict);
        }

        let created = Timestamp::now().map_err(|()| Error::Internal)?;
        let key = ReportKey::new(&self.user.id, created);
        let data = ReportData {
            date: date.into(),
            text: text.into(),
            user_id: self.user.id.clone(),
        };

        self.app
            .0
            .write_report(&key, &data)
            .await
            .map_err(|()| Error::Internal)?;

        info!("{username} saved report \"{key}\"");
        Ok(Report::from_stored(&key, data))
    }

    pub async fn update_report(&self, key: &ReportKey, date: &str, text: &str) -> Result<Report> {
        let username = &self.user.username;

        self.check_owner(key)?;

        report::parse_date(date).map_err(|e| {
            error!("{username} submitted an unusable date {date:?}: {e}");
            Error::BadRequest
        })?;

        match self.app.0.report(key).await {
            Ok(_) => {}
            Err(FindError::NotFound) => return Err(Error::NotFound),
            Err(FindError::Internal) => return Err(Error::Internal),
        }

        if let Some(existing) = self
            .app
            .date_conflict(key.user_id(), date, Some(key))
            .await?
        {
            info!(
                "{username} can't move report \"{key}\" onto {}: \"{existing}\" is already there",
                report::date_part(date)
            );
            return Err(Error::Conflict);
        }

        // ownership follows the key, not the session: the master edits
        // other people's reports in place
        let data = ReportData {
            date: date.into(),
            text: text.into(),
            user_id: key.user_id().to_string(),
        };

        self.app
            .0
            .write_report(key, &data)
            .await
            .map_err(|()| Error::Internal)?;

        info!("{username} updated report \"{key}\"");
        Ok(Report::from_stored(key, data))
    }

    pub async fn delete_report(&self, key: &ReportKey) -> Result<()> {
        let username = &self.user.username;

        self.check_owner(key)?;

        self.app.0.remove_report(key).await.map_err(|e| match e {
            FindError::NotFound => Error::NotFound,
            FindError::Internal => Error::Internal,
        })?;

        info!("{username} deleted report \"{key}\"");
        Ok(())
    }

    /// The download artifact for one report: its file name and the
    /// rendered document.
    pub async fn download_report(&self, key: &ReportKey) -> Result<(String, String)> {
        let username = &self.user.username;

        self.check_owner(key)?;

        let data = self.app.0.report(key).await.map_err(|e| match e {
            FindError::NotFound => Error::NotFound,
            FindError::Internal => Error::Internal,
        })?;

        let file_name = doc::file_name(&data.date).map_err(|e| {
            error!("couldn't parse date of report \"{key}\": {e}");
            Error::Internal
        })?;

        info!("{username} downloaded report \"{key}\"");
        Ok((file_name, doc::render(&data.text)))
    }

    fn check_owner(&self, key: &ReportKey) -> Result<()> {
        if self.is_master() || key.user_id() == self.user.id {
            Ok(())
        } else {
            error!(
                "{} denied access to report \"{key}\"",
                self.user.username
            );
            Err(Error::Unauthorized)
        }
    }
}

impl RapportiniAuthed<true> {
    pub async fn users(&self) -> Result<Vec<UserInfo>> {
        trace!("master listing users");

        let users = self.app.0.users().await.map_err(|()| Error::Internal)?;
        Ok(users.iter().map(UserInfo::from).collect())
    }

    pub async fn add_user(
        &self,
        username: &str,
        name: &str,
        password: Option<&str>,
    ) -> result::Result<UserInfo, AddUserError> {
        let username = username.trim().to_lowercase();
        if username.is_empty() {
            return Err(AddUserError::MissingUsername);
        }

        let mut users = self
            .app
            .0
            .users()
            .await
            .map_err(|()| AddUserError::Internal)?;

        if users.iter().any(|u| u.username.to_lowercase() == username) {
            info!("master tried to add already-taken username {username}");
            return Err(AddUserError::UsernameTaken);
        }

        let password = match password {
            Some(p) if p.len() >= MIN_PASSWORD_LEN => p.to_string(),
            _ => return Err(AddUserError::WeakPassword),
        };

        let created = Timestamp::now().map_err(|()| AddUserError::Internal)?;
        let name = name.trim();

        let user = User {
            id: format!("user_{}", created.as_millis()),
            name: if name.is_empty() {
                username.clone()
            } else {
                name.to_string()
            },
            username,
            is_active: true,
            password: Some(password),
            session_id: None,
        };

        users.push(user.clone());
        self.app
            .0
            .write_users(&users)
            .await
            .map_err(|()| AddUserError::Internal)?;

        info!("master added user {}", user.username);
        Ok(UserInfo::from(&user))
    }

    pub async fn update_user(&self, id: &str, update: UserUpdate) -> Result<UserInfo> {
        let mut users = self.app.0.users().await.map_err(|()| Error::Internal)?;

        let UserUpdate {
            username,
            name,
            is_active,
            password,
        } = update;

        let username = username.map(|u| u.trim().to_lowercase());

        if let Some(ref new_username) = username {
            let collides = users
                .iter()
                .any(|u| u.id != id && u.username.to_lowercase() == *new_username);
            if collides {
                info!("master tried to rename {id} to already-taken username {new_username}");
                return Err(Error::Conflict);
            }
        }

        let info = {
            let user = users
                .iter_mut()
                .find(|u| u.id == id)
                .ok_or(Error::NotFound)?;

            if let Some(username) = username {
                user.username = username;
            }
            if let Some(name) = name {
                user.name = name;
            }
            if let Some(is_active) = is_active {
                user.is_active = is_active;
            }
            if let Some(password) = password {
                user.password = Some(password);
            }

            UserInfo::from(&*user)
        };

        self.app
            .0
            .write_users(&users)
            .await
            .map_err(|()| Error::Internal)?;

        info!("master updated user {id}");
        Ok(info)
    }

    pub async fn delete_user(&self, id: &str) -> Result<()> {
        let mut users = self.app.0.users().await.map_err(|()| Error::Internal)?;

        let before = users.len();
        users.retain(|u| u.id != id);
        if users.len() == before {
            return Err(Error::NotFound);
        }

        self.app
            .0
            .write_users(&users)
            .await
            .map_err(|()| Error::Internal)?;

        info!("master deleted user {id}");
        Ok(())
    }

    /// The master list view: every user's reports in the window, grouped
    /// by owner. Groups come out ordered by their newest report; `search`
    /// filters them by display name, `sort` orders each group's reports.
    pub async fn grouped_reports(
        &self,
        search: &str,
        sort: SortOrder,
    ) -> Result<Vec<ReportGroup>> {
        let reports = self.app.collect_reports(None).await?;
        let users = self.app.0.users().await.map_err(|()| Error::Internal)?;

        let names: HashMap<&str, &str> = users
            .iter()
            .map(|u| (u.id.as_str(), u.name.as_str()))
            .collect();

        let mut groups: Vec<ReportGroup> = vec![];

        for report in reports {
            match groups.iter_mut().find(|g| g.user_id == report.user_id) {
                Some(group) => group.reports.push(report),
                None => {
                    let user_name = names
                        .get(report.user_id.as_str())
                        .copied()
                        .unwrap_or(report.user_id.as_str())
                        .to_string();

                    groups.push(ReportGroup {
                        user_id: report.user_id.clone(),
                        user_name,
                        reports: vec![report],
                    });
                }
            }
        }

        let search = search.to_lowercase();
        groups.retain(|g| g.user_name.to_lowercase().contains(&search));

        // collect_reports hands the window newest-first already
        if sort == SortOrder::Oldest {
            for group in &mut groups {
                group.reports.reverse();
            }
        }

        trace!(
            "master grouped {} owners, search {search:?}, {sort:?}",
            groups.len()
        );
        Ok(groups)
    }
}

fn parse_stored_users(raw: &str) -> Vec<User> {
    let values: Vec<serde_json::Value> = match serde_json::from_str(raw) {
        Ok(values) => values,
        Err(e) => {
            error!("couldn't parse stored users: {e}");
            return vec![];
        }
    };

    // records from the old schema carried an email field; throw the whole
    // list away rather than guess at a migration
    if values.iter().any(|v| v.get("email").is_some()) {
        info!("discarding legacy user records (email field present)");
        return vec![];
    }

    match values
        .into_iter()
        .map(serde_json::from_value)
        .collect::<result::Result<Vec<User>, _>>()
    {
        Ok(users) => users,
        Err(e) => {
            error!("couldn't parse stored users: {e}");
            vec![]
        }
    }
}
