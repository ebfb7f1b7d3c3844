mod args;
mod auth;
mod backend;
mod doc;
mod rapportini;
mod report;
mod time;
mod user;

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use cookie::{Cookie, SameSite};
use log::{error, info};
use serde::{Deserialize, Serialize};
use warp::{http::StatusCode, Filter, Rejection, Reply};

use crate::args::Args;
use crate::auth::{Credentials, SessionId};
use crate::backend::Backend;
use crate::rapportini::{
    AddUserError, Error, LoginFailure, Rapportini, RapportiniAuthed, SortOrder,
};
use crate::report::ReportKey;
use crate::user::{UserInfo, UserUpdate};

const SESSION_COOKIE: &str = "sessionid";

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let args = Args::parse();
    let addr = match args.addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid listen address: {e}");
            std::process::exit(1);
        }
    };

    let backend = match Backend::new(args.data_dir()).await {
        Ok(backend) => backend,
        Err(e) => {
            error!("couldn't open data dir {:?}: {e}", args.data_dir());
            std::process::exit(1);
        }
    };

    let app = Arc::new(Rapportini::new(backend));
    if let Err(e) = app.bootstrap_users().await {
        error!("couldn't initialise user storage: {e:?}");
        std::process::exit(1);
    }

    let routes = routes(app, args.secure())
        .recover(handle_rejection)
        .with(warp::log("rapportini"));

    info!("listening on {addr}");
    warp::serve(routes).run(addr).await;
}

fn routes(
    app: Arc<Rapportini>,
    secure: bool,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let login = warp::path!("api" / "auth" / "login")
        .and(warp::post())
        .and(with_app(Arc::clone(&app)))
        .and(warp::header::<String>("authorization"))
        .and(warp::cookie::optional::<String>(SESSION_COOKIE))
        .and_then(move |app: Arc<Rapportini>, header: String, session: Option<String>| {
            async move {
                let creds = Credentials::from_str(&header).map_err(|e| {
                    error!("bad authorization header: {e}");
                    warp::reject::custom(Error::BadRequest)
                })?;

                if creds.user().is_empty() || creds.pass().is_empty() {
                    return Err(warp::reject::custom(Error::BadRequest));
                }

                let session = session.and_then(|raw| SessionId::from_str(&raw).ok());
                let authed = app
                    .login(creds, session)
                    .await
                    .map_err(warp::reject::custom)?;

                Ok::<_, Rejection>(login_reply(&authed, secure))
            }
        });

    let master_login = warp::path!("api" / "auth" / "master")
        .and(warp::post())
        .and(with_app(Arc::clone(&app)))
        .and(warp::body::json())
        .and(warp::cookie::optional::<String>(SESSION_COOKIE))
        .and_then(
            move |app: Arc<Rapportini>, body: MasterLogin, session: Option<String>| async move {
                let session = session.and_then(|raw| SessionId::from_str(&raw).ok());
                let authed = app
                    .login_master(&body.password, session)
                    .await
                    .map_err(warp::reject::custom)?;

                Ok::<_, Rejection>(login_reply(&authed, secure))
            },
        );

    let logout = warp::path!("api" / "auth" / "logout")
        .and(warp::post())
        .and(authed(Arc::clone(&app)))
        .and_then(|authed: RapportiniAuthed| async move {
            authed.logout().await.map_err(warp::reject::custom)?;

            let cookie = Cookie::build((SESSION_COOKIE, ""))
                .path("/")
                .http_only(true)
                .max_age(::time::Duration::ZERO)
                .build();

            Ok::<_, Rejection>(warp::reply::with_header(
                warp::reply::json(&OkReply { success: true }),
                "set-cookie",
                cookie.to_string(),
            ))
        });

    let reports_grouped = warp::path!("api" / "reports" / "grouped")
        .and(warp::get())
        .and(authed(Arc::clone(&app)))
        .and(warp::query::<GroupedQuery>())
        .and_then(|authed: RapportiniAuthed, query: GroupedQuery| async move {
            let master = authed.require_master().map_err(warp::reject::custom)?;
            let groups = master
                .grouped_reports(
                    query.q.as_deref().unwrap_or(""),
                    query.sort.unwrap_or_default(),
                )
                .await
                .map_err(warp::reject::custom)?;

            Ok::<_, Rejection>(warp::reply::json(&groups))
        });

    let reports_list = warp::path!("api" / "reports")
        .and(warp::get())
        .and(authed(Arc::clone(&app)))
        .and_then(|authed: RapportiniAuthed| async move {
            let reports = authed.reports().await.map_err(warp::reject::custom)?;
            Ok::<_, Rejection>(warp::reply::json(&reports))
        });

    let report_create = warp::path!("api" / "reports")
        .and(warp::post())
        .and(authed(Arc::clone(&app)))
        .and(warp::body::json())
        .and_then(|authed: RapportiniAuthed, body: ReportBody| async move {
            let report = authed
                .create_report(&body.date, &body.text)
                .await
                .map_err(warp::reject::custom)?;

            Ok::<_, Rejection>(warp::reply::with_status(
                warp::reply::json(&report),
                StatusCode::CREATED,
            ))
        });

    let report_update = warp::path!("api" / "reports" / String)
        .and(warp::put())
        .and(authed(Arc::clone(&app)))
        .and(warp::body::json())
        .and_then(
            |raw: String, authed: RapportiniAuthed, body: ReportBody| async move {
                let key = report_key(&raw)?;
                let report = authed
                    .update_report(&key, &body.date, &body.text)
                    .await
                    .map_err(warp::reject::custom)?;

                Ok::<_, Rejection>(warp::reply::json(&report))
            },
        );

    let report_delete = warp::path!("api" / "reports" / String)
        .and(warp::delete())
        .and(authed(Arc::clone(&app)))
        .and_then(|raw: String, authed: RapportiniAuthed| async move {
            let key = report_key(&raw)?;
            authed
                .delete_report(&key)
                .await
                .map_err(warp::reject::custom)?;

            Ok::<_, Rejection>(warp::reply::json(&OkReply { success: true }))
        });

    let report_download = warp::path!("api" / "reports" / String / "download")
        .and(warp::get())
        .and(authed(Arc::clone(&app)))
        .and_then(|raw: String, authed: RapportiniAuthed| async move {
            let key = report_key(&raw)?;
            let (file_name, html) = authed
                .download_report(&key)
                .await
                .map_err(warp::reject::custom)?;

            let reply = warp::reply::with_header(html, "content-type", doc::MIME_TYPE);
            let reply = warp::reply::with_header(
                reply,
                "content-disposition",
                format!("attachment; filename=\"{file_name}\""),
            );
            Ok::<_, Rejection>(reply)
        });

    let users_list = warp::path!("api" / "users")
        .and(warp::get())
        .and(authed(Arc::clone(&app)))
        .and_then(|authed: RapportiniAuthed| async move {
            let master = authed.require_master().map_err(warp::reject::custom)?;
            let users: Vec<UserInfo> = master.users().await.map_err(warp::reject::custom)?;
            Ok::<_, Rejection>(warp::reply::json(&users))
        });

    let user_add = warp::path!("api" / "users")
        .and(warp::post())
        .and(authed(Arc::clone(&app)))
        .and(warp::body::json())
        .and_then(|authed: RapportiniAuthed, body: AddUserBody| async move {
            let master = authed.require_master().map_err(warp::reject::custom)?;
            let user = master
                .add_user(
                    &body.username,
                    body.name.as_deref().unwrap_or(""),
                    body.password.as_deref(),
                )
                .await
                .map_err(warp::reject::custom)?;

            Ok::<_, Rejection>(warp::reply::with_status(
                warp::reply::json(&user),
                StatusCode::CREATED,
            ))
        });

    let user_update = warp::path!("api" / "users" / String)
        .and(warp::patch())
        .and(authed(Arc::clone(&app)))
        .and(warp::body::json())
        .and_then(
            |id: String, authed: RapportiniAuthed, update: UserUpdate| async move {
                let master = authed.require_master().map_err(warp::reject::custom)?;
                let user = master
                    .update_user(&id, update)
                    .await
                    .map_err(warp::reject::custom)?;

                Ok::<_, Rejection>(warp::reply::json(&user))
            },
        );

    let user_delete = warp::path!("api" / "users" / String)
        .and(warp::delete())
        .and(authed(Arc::clone(&app)))
        .and_then(|id: String, authed: RapportiniAuthed| async move {
            let master = authed.require_master().map_err(warp::reject::custom)?;
            master
                .delete_user(&id)
                .await
                .map_err(warp::reject::custom)?;

            Ok::<_, Rejection>(warp::reply::json(&OkReply { success: true }))
        });

    login
        .or(master_login)
        .or(logout)
        .or(reports_grouped)
        .or(reports_list)
        .or(report_create)
        .or(report_update)
        .or(report_delete)
        .or(report_download)
        .or(users_list)
        .or(user_add)
        .or(user_update)
        .or(user_delete)
}

fn with_app(
    app: Arc<Rapportini>,
) -> impl Filter<Extract = (Arc<Rapportini>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&app))
}

/// Resolve the session cookie into an authenticated handle.
fn authed(
    app: Arc<Rapportini>,
) -> impl Filter<Extract = (RapportiniAuthed,), Error = Rejection> + Clone {
    with_app(app)
        .and(warp::cookie::<String>(SESSION_COOKIE))
        .and_then(|app: Arc<Rapportini>, raw: String| async move {
            let session_id = SessionId::from_str(&raw)
                .map_err(|()| warp::reject::custom(Error::Unauthorized))?;

            app.authenticate(session_id)
                .await
                .map_err(warp::reject::custom)
        })
}

fn report_key(raw: &str) -> Result<ReportKey, Rejection> {
    ReportKey::from_str(raw).map_err(|e| {
        error!("bad report key: {e}");
        warp::reject::custom(Error::BadRequest)
    })
}

fn login_reply(authed: &RapportiniAuthed, secure: bool) -> impl Reply {
    let cookie = Cookie::build((SESSION_COOKIE, authed.session_id().to_string()))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .build();

    warp::reply::with_header(
        warp::reply::json(&LoginReply {
            success: true,
            user: authed.info(),
        }),
        "set-cookie",
        cookie.to_string(),
    )
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, reply) = if let Some(failure) = err.find::<LoginFailure>() {
        (
            StatusCode::UNAUTHORIZED,
            warp::reply::json(&LoginErrorReply {
                success: false,
                reason: failure.reason(),
                message: failure.message(),
            }),
        )
    } else if let Some(e) = err.find::<AddUserError>() {
        (
            e.status(),
            warp::reply::json(&ErrorReply {
                success: false,
                message: e.message(),
            }),
        )
    } else if let Some(e) = err.find::<Error>() {
        (
            (*e).into(),
            warp::reply::json(&ErrorReply {
                success: false,
                message: e.message(),
            }),
        )
    } else if err.is_not_found() {
        (
            StatusCode::NOT_FOUND,
            warp::reply::json(&ErrorReply {
                success: false,
                message: Error::NotFound.message(),
            }),
        )
    } else if err.find::<warp::reject::MissingCookie>().is_some() {
        (
            StatusCode::UNAUTHORIZED,
            warp::reply::json(&ErrorReply {
                success: false,
                message: Error::Unauthorized.message(),
            }),
        )
    } else if err.find::<warp::reject::MissingHeader>().is_some()
        || err.find::<warp::body::BodyDeserializeError>().is_some()
        || err.find::<warp::reject::InvalidQuery>().is_some()
    {
        (
            StatusCode::BAD_REQUEST,
            warp::reply::json(&ErrorReply {
                success: false,
                message: Error::BadRequest.message(),
            }),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            warp::reply::json(&ErrorReply {
                success: false,
                message: Error::BadRequest.message(),
            }),
        )
    } else {
        error!("unhandled rejection: {err:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            warp::reply::json(&ErrorReply {
                success: false,
                message: Error::Internal.message(),
            }),
        )
    };

    Ok(warp::reply::with_status(reply, status))
}

#[derive(Debug, Deserialize)]
struct MasterLogin {
    password: String,
}

#[derive(Debug, Deserialize)]
struct ReportBody {
    date: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct AddUserBody {
    username: String,
    name: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GroupedQuery {
    q: Option<String>,
    sort: Option<SortOrder>,
}

#[derive(Debug, Serialize)]
struct LoginReply {
    success: bool,
    user: UserInfo,
}

#[derive(Debug, Serialize)]
struct OkReply {
    success: bool,
}

#[derive(Debug, Serialize)]
struct ErrorReply {
    success: bool,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct LoginErrorReply {
    success: bool,
    reason: &'static str,
    message: &'static str,
}
