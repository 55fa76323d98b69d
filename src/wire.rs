//! JSON-lines wire protocol.
//!
//! One request per line, one response per line. Every request may carry a
//! `user` field naming the caller; ops that act on an account require it,
//! admin ops additionally require the account to be an admin. Each request
//! first runs a reconciliation pass, so responses always reflect the
//! current moment, and the caller's unread notifications ride along on the
//! response that drains them.

use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use crate::auth;
use crate::engine::{Engine, EngineError};
use crate::model::{LotProfile, Ms, Notification, Span, UserInfo, unix_now_ms};
use crate::observability;

const MAX_LINE_LEN: usize = 64 * 1024;

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub user: Option<Ulid>,
    #[serde(flatten)]
    pub op: Op,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Register {
        email: String,
        password: String,
        name: String,
    },
    Login {
        email: String,
        password: String,
    },
    Cities,
    SearchLots {
        #[serde(default)]
        query: String,
    },
    FindAvailability {
        lot: Ulid,
        start: Ms,
        end: Ms,
    },
    Reserve {
        lot: Ulid,
        #[serde(default)]
        spot: Option<Ulid>,
        start: Ms,
        end: Ms,
        vehicle: String,
    },
    ReleaseBooking {
        booking: Ulid,
    },
    MyBookings,
    MyHistory {
        #[serde(default = "default_limit")]
        limit: usize,
    },
    MySummary,
    UpdateProfile {
        email: String,
        #[serde(default)]
        password: Option<String>,
        name: String,
    },
    DeleteAccount,
    CreateLot {
        name: String,
        address: String,
        city: String,
        pincode: String,
        #[serde(default)]
        area_type: String,
        price_per_hour: f64,
        spots: usize,
    },
    UpdateLot {
        lot: Ulid,
        name: String,
        address: String,
        city: String,
        pincode: String,
        #[serde(default)]
        area_type: String,
        price_per_hour: f64,
    },
    DeleteLot {
        lot: Ulid,
    },
    AddSpot {
        lot: Ulid,
    },
    RemoveSpot {
        spot: Ulid,
    },
    LotSpots {
        lot: Ulid,
    },
    SpotDetails {
        spot: Ulid,
    },
    Totals,
    TopLots {
        #[serde(default = "default_limit")]
        limit: usize,
    },
    ListUsers,
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Register { .. } => "register",
            Op::Login { .. } => "login",
            Op::Cities => "cities",
            Op::SearchLots { .. } => "search_lots",
            Op::FindAvailability { .. } => "find_availability",
            Op::Reserve { .. } => "reserve",
            Op::ReleaseBooking { .. } => "release_booking",
            Op::MyBookings => "my_bookings",
            Op::MyHistory { .. } => "my_history",
            Op::MySummary => "my_summary",
            Op::UpdateProfile { .. } => "update_profile",
            Op::DeleteAccount => "delete_account",
            Op::CreateLot { .. } => "create_lot",
            Op::UpdateLot { .. } => "update_lot",
            Op::DeleteLot { .. } => "delete_lot",
            Op::AddSpot { .. } => "add_spot",
            Op::RemoveSpot { .. } => "remove_spot",
            Op::LotSpots { .. } => "lot_spots",
            Op::SpotDetails { .. } => "spot_details",
            Op::Totals => "totals",
            Op::TopLots { .. } => "top_lots",
            Op::ListUsers => "list_users",
        }
    }
}

enum Access {
    Public,
    User,
    Admin,
}

fn access_for(op: &Op) -> Access {
    match op {
        Op::Register { .. }
        | Op::Login { .. }
        | Op::Cities
        | Op::SearchLots { .. }
        | Op::FindAvailability { .. } => Access::Public,
        Op::Reserve { .. }
        | Op::ReleaseBooking { .. }
        | Op::MyBookings
        | Op::MyHistory { .. }
        | Op::MySummary
        | Op::UpdateProfile { .. }
        | Op::DeleteAccount => Access::User,
        Op::CreateLot { .. }
        | Op::UpdateLot { .. }
        | Op::DeleteLot { .. }
        | Op::AddSpot { .. }
        | Op::RemoveSpot { .. }
        | Op::LotSpots { .. }
        | Op::SpotDetails { .. }
        | Op::Totals
        | Op::TopLots { .. }
        | Op::ListUsers => Access::Admin,
    }
}

#[derive(Debug, Serialize)]
struct WireError {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
pub struct Response {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    notices: Vec<Notification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// Internal failure carrying its wire code, so dispatch arms can fail with
/// engine errors and wire-level errors alike.
struct Failure {
    code: &'static str,
    message: String,
}

impl Failure {
    fn unauthorized(message: &str) -> Self {
        Self {
            code: "unauthorized",
            message: message.to_string(),
        }
    }
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        let code = match &e {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::EmailInUse(_) => "email_in_use",
            EngineError::InvalidInterval(_) => "invalid_interval",
            EngineError::Validation(_) => "validation",
            EngineError::NoAvailability => "no_availability",
            EngineError::Conflict(_) => "conflict",
            EngineError::Integrity(_) => "integrity",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "internal",
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}

fn json<T: Serialize>(value: T) -> Result<Value, Failure> {
    serde_json::to_value(value).map_err(|e| Failure {
        code: "internal",
        message: e.to_string(),
    })
}

/// Serve one client until it disconnects or sends an unframeable line.
pub async fn process_connection(stream: TcpStream, engine: Arc<Engine>) {
    let peer = stream.peer_addr().ok();
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!(?peer, error = %e, "dropping connection");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(&engine, request).await,
            Err(e) => Response {
                ok: false,
                error: Some(WireError {
                    code: "validation",
                    message: format!("malformed request: {e}"),
                }),
                notices: Vec::new(),
                data: None,
            },
        };

        let payload = serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"ok":false,"error":{"code":"internal","message":"response serialization failed"}}"#.to_string());
        if framed.send(payload).await.is_err() {
            break;
        }
    }
}

async fn handle_request(engine: &Engine, request: Request) -> Response {
    let now = unix_now_ms();
    let op_name = request.op.name();
    let started = Instant::now();

    // Bring time-dependent state current before answering.
    if let Err(e) = engine.reconcile(now).await {
        tracing::error!(error = %e, "pre-request reconciliation failed");
        return failure_response(e.into(), Vec::new());
    }

    let caller = match authorize(engine, &request) {
        Ok(caller) => caller,
        Err(f) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => op_name, "outcome" => "denied")
                .increment(1);
            return failure_response(f, Vec::new());
        }
    };

    let result = dispatch(engine, caller.as_ref(), request.op, now).await;

    // Deliver pending notifications with whatever response goes out.
    let notices = match &caller {
        Some(user) => engine.drain_unread(user.id).await.unwrap_or_default(),
        None => Vec::new(),
    };

    let outcome = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op_name, "outcome" => outcome)
        .increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op_name)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(data) => Response {
            ok: true,
            error: None,
            notices,
            data: Some(data),
        },
        Err(f) => failure_response(f, notices),
    }
}

fn failure_response(f: Failure, notices: Vec<Notification>) -> Response {
    Response {
        ok: false,
        error: Some(WireError {
            code: f.code,
            message: f.message,
        }),
        notices,
        data: None,
    }
}

fn authorize(engine: &Engine, request: &Request) -> Result<Option<crate::model::User>, Failure> {
    let caller = match request.user {
        Some(id) => Some(
            engine
                .get_user(&id)
                .ok_or_else(|| Failure::unauthorized("unknown user"))?,
        ),
        None => None,
    };

    match access_for(&request.op) {
        Access::Public => Ok(caller),
        Access::User => {
            if caller.is_none() {
                return Err(Failure::unauthorized("login required"));
            }
            Ok(caller)
        }
        Access::Admin => match &caller {
            Some(user) if user.is_admin => Ok(caller),
            Some(_) => Err(Failure::unauthorized("admin access required")),
            None => Err(Failure::unauthorized("login required")),
        },
    }
}

fn need(caller: Option<&crate::model::User>) -> Result<&crate::model::User, Failure> {
    caller.ok_or_else(|| Failure::unauthorized("login required"))
}

async fn dispatch(
    engine: &Engine,
    caller: Option<&crate::model::User>,
    op: Op,
    now: Ms,
) -> Result<Value, Failure> {
    match op {
        Op::Register {
            email,
            password,
            name,
        } => {
            let info = engine.register_user(&email, &password, &name, false).await?;
            json(info)
        }
        Op::Login { email, password } => {
            let user = engine
                .user_by_email(&email)
                .filter(|u| auth::verify_password(&password, &u.pass_hash))
                .ok_or_else(|| Failure::unauthorized("invalid email or password"))?;
            json(UserInfo::from(&user))
        }
        Op::Cities => json(engine.cities().await),
        Op::SearchLots { query } => json(engine.search_lots(&query, now).await),
        Op::FindAvailability { lot, start, end } => {
            let report = engine
                .compute_availability(lot, Span { start, end }, now)
                .await?;
            json(report)
        }
        Op::Reserve {
            lot,
            spot,
            start,
            end,
            vehicle,
        } => {
            let user = need(caller)?;
            let booking = engine
                .reserve(user.id, lot, spot, Span { start, end }, &vehicle, now)
                .await?;
            json(booking)
        }
        Op::ReleaseBooking { booking } => {
            let user = need(caller)?;
            let (kind, record) = engine.release_booking(user.id, booking, now).await?;
            json(serde_json::json!({ "outcome": kind, "record": record }))
        }
        Op::MyBookings => {
            let user = need(caller)?;
            json(engine.user_bookings(user.id).await)
        }
        Op::MyHistory { limit } => {
            let user = need(caller)?;
            json(engine.user_history(user.id, limit))
        }
        Op::MySummary => {
            let user = need(caller)?;
            json(engine.user_summary(user.id))
        }
        Op::UpdateProfile {
            email,
            password,
            name,
        } => {
            let user = need(caller)?;
            let info = engine
                .update_user(user.id, &email, password.as_deref(), &name)
                .await?;
            json(info)
        }
        Op::DeleteAccount => {
            let user = need(caller)?;
            engine.delete_user(user.id, now).await?;
            Ok(Value::Null)
        }
        Op::CreateLot {
            name,
            address,
            city,
            pincode,
            area_type,
            price_per_hour,
            spots,
        } => {
            let id = engine
                .create_lot(
                    LotProfile {
                        name,
                        address,
                        city,
                        pincode,
                        area_type,
                        price_per_hour,
                    },
                    spots,
                )
                .await?;
            json(serde_json::json!({ "lot": id }))
        }
        Op::UpdateLot {
            lot,
            name,
            address,
            city,
            pincode,
            area_type,
            price_per_hour,
        } => {
            engine
                .update_lot(
                    lot,
                    LotProfile {
                        name,
                        address,
                        city,
                        pincode,
                        area_type,
                        price_per_hour,
                    },
                )
                .await?;
            Ok(Value::Null)
        }
        Op::DeleteLot { lot } => {
            engine.delete_lot(lot).await?;
            Ok(Value::Null)
        }
        Op::AddSpot { lot } => {
            let id = engine.add_spot(lot).await?;
            json(serde_json::json!({ "spot": id }))
        }
        Op::RemoveSpot { spot } => {
            let lot = engine
                .lot_for_spot(&spot)
                .ok_or(EngineError::NotFound(spot))?;
            engine.remove_spot(lot, spot).await?;
            Ok(Value::Null)
        }
        Op::LotSpots { lot } => {
            let (stats, spots) = engine.lot_spots(lot, now).await?;
            json(serde_json::json!({ "lot": stats, "spots": spots }))
        }
        Op::SpotDetails { spot } => json(engine.spot_details(spot, now).await?),
        Op::Totals => json(engine.platform_totals().await),
        Op::TopLots { limit } => json(engine.top_lots(limit)),
        Op::ListUsers => json(engine.list_users()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reserve_request() {
        let user = Ulid::new();
        let lot = Ulid::new();
        let line = format!(
            r#"{{"user":"{user}","op":"reserve","lot":"{lot}","start":1000,"end":2000,"vehicle":"KA-01-1234"}}"#
        );
        let req: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(req.user, Some(user));
        match req.op {
            Op::Reserve {
                lot: l,
                spot,
                start,
                end,
                vehicle,
            } => {
                assert_eq!(l, lot);
                assert_eq!(spot, None);
                assert_eq!((start, end), (1000, 2000));
                assert_eq!(vehicle, "KA-01-1234");
            }
            other => panic!("wrong op: {other:?}"),
        }
    }

    #[test]
    fn parses_anonymous_search() {
        let req: Request =
            serde_json::from_str(r#"{"op":"search_lots","query":"pune"}"#).unwrap();
        assert_eq!(req.user, None);
        assert!(matches!(req.op, Op::SearchLots { ref query } if query == "pune"));
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"op":"frobnicate"}"#).is_err());
    }

    #[test]
    fn error_codes_are_stable() {
        let f = Failure::from(EngineError::NoAvailability);
        assert_eq!(f.code, "no_availability");
        let f = Failure::from(EngineError::Conflict(Ulid::new()));
        assert_eq!(f.code, "conflict");
        let f = Failure::from(EngineError::InvalidInterval("x"));
        assert_eq!(f.code, "invalid_interval");
        let f = Failure::from(EngineError::WalError("x".into()));
        assert_eq!(f.code, "internal");
    }

    #[test]
    fn admin_ops_require_admin_access() {
        assert!(matches!(access_for(&Op::Totals), Access::Admin));
        assert!(matches!(access_for(&Op::ListUsers), Access::Admin));
        assert!(matches!(access_for(&Op::Cities), Access::Public));
        assert!(matches!(access_for(&Op::MyBookings), Access::User));
    }
}
