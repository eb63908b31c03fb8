use actix_web::{
    http::StatusCode,
    web::{self, Buf, Bytes, ServiceConfig},
    HttpRequest, HttpResponse, Responder, ResponseError,
};
use serde::Serialize;

use axis::{
    db::{conn::DatabaseConnection, models::Agent},
    key::Key,
    protocol::{Ack, PollResponse, Request, SIGNATURE_HEADER},
    settings::Settings,
};

use derive_more::derive::{Display, Error};

/// Configuration for the API services.
pub fn config(cfg: &mut ServiceConfig, settings: &Settings) {
    let s = settings.clone();
    cfg.route(
        "/api/register",
        web::post().to(move |req, pl| register(s.clone(), req, pl)),
    );
    let s = settings.clone();
    cfg.route(
        "/api/poll",
        web::post().to(move |req, pl| poll(s.clone(), req, pl)),
    );
    let s = settings.clone();
    cfg.route(
        "/api/report",
        web::post().to(move |req, pl| report(s.clone(), req, pl)),
    );
}

#[derive(Serialize, Debug, Display, Error)]
#[display("error response: {status} on {path}")]
struct ErrorResponse {
    status: u16,
    error: String,
    message: String,
    path: String,
}

impl actix_web::error::ResponseError for ErrorResponse {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self)
    }
    fn status_code(&self) -> actix_web::http::StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl ErrorResponse {
    fn new(req: &HttpRequest, status: StatusCode, msg: &str) -> ErrorResponse {
        ErrorResponse {
            status: status.as_u16(),
            error: status
                .canonical_reason()
                .unwrap_or("error")
                .to_lowercase(),
            message: msg.to_string(),
            path: req.path().to_string(),
        }
    }
    fn unauthorized(req: &HttpRequest, msg: &str) -> ErrorResponse {
        Self::new(req, StatusCode::UNAUTHORIZED, msg)
    }
    fn bad_request(req: &HttpRequest, msg: &str) -> ErrorResponse {
        Self::new(req, StatusCode::BAD_REQUEST, msg)
    }
    fn not_found(req: &HttpRequest, msg: &str) -> ErrorResponse {
        Self::new(req, StatusCode::NOT_FOUND, msg)
    }
    fn internal_server_error(req: &HttpRequest) -> ErrorResponse {
        Self::new(
            req,
            StatusCode::INTERNAL_SERVER_ERROR,
            "see the master log for details",
        )
    }
}

/// "404: Not found" response for API requests.
/// This function is configured in main.rs
pub fn not_found(req: HttpRequest) -> Result<HttpResponse, actix_web::Error> {
    Ok(ErrorResponse::not_found(&req, "API resource could not be found").error_response())
}

fn ack(code: StatusCode, msg: &str) -> HttpResponse {
    HttpResponse::build(code).json(Ack {
        code: code.as_u16(),
        message: msg.to_string(),
    })
}

fn peer_ip(req: &HttpRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or("unknown".to_string())
}

/// Reads the body within the size limit and decodes it. The raw bytes are
/// returned as well since the signature covers them.
async fn read_request(
    settings: &Settings,
    req: &HttpRequest,
    payload: web::Payload,
) -> Result<(Request, Bytes), ErrorResponse> {
    let payload_bytes = payload
        .to_bytes_limited(settings.master.max_payload)
        .await
        .map_err(|e| {
            log::warn!("Error reading payload: {e}");
            ErrorResponse::bad_request(req, "payload too large")
        })?
        .map_err(|e| {
            log::warn!("Error reading payload: {e}");
            ErrorResponse::bad_request(req, "bad payload")
        })?;

    let request: Request = serde_json::from_slice(payload_bytes.chunk()).map_err(|err| {
        log::warn!("Received invalid JSON payload: {err:?}");
        ErrorResponse::bad_request(req, "invalid JSON format")
    })?;

    if request.endpoint() != req.path() {
        log::warn!("Request {} sent to {}", request.endpoint(), req.path());
        return Err(ErrorResponse::bad_request(req, "request does not match endpoint"));
    }
    Ok((request, payload_bytes))
}

/// Checks the signature header against `key`.
fn verify(req: &HttpRequest, key: &Key, body: &Bytes) -> Result<(), ErrorResponse> {
    let received = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|hv| hv.to_str().ok())
        .ok_or(ErrorResponse::unauthorized(req, "missing signature"))?;

    if !key.verify(body.chunk(), received) {
        log::warn!("Invalid signature from {}", peer_ip(req));
        return Err(ErrorResponse::unauthorized(req, "invalid signature"));
    }
    Ok(())
}

fn connect(settings: &Settings, req: &HttpRequest) -> Result<DatabaseConnection, ErrorResponse> {
    DatabaseConnection::connect(settings).map_err(|err| {
        log::error!("Could not connect to database: {err}");
        ErrorResponse::internal_server_error(req)
    })
}

/// Looks up a known agent and verifies the request with its stored key.
fn authenticate(
    conn: &mut DatabaseConnection,
    req: &HttpRequest,
    host: &str,
    body: &Bytes,
) -> Result<Agent, ErrorResponse> {
    let agent = conn
        .agent_by_sn(host)
        .map_err(|_| ErrorResponse::internal_server_error(req))?
        .ok_or_else(|| {
            log::warn!("Request from unknown agent {host}");
            ErrorResponse::not_found(req, "unknown agent")
        })?;
    let key: Key = agent.key.parse().map_err(|e| {
        log::error!("Stored key of agent {host} is invalid: {e}");
        ErrorResponse::internal_server_error(req)
    })?;
    verify(req, &key, body)?;
    Ok(agent)
}

/// An agent announces itself.
///
/// Unknown agents are stored disabled until an operator accepts them. A known
/// agent must present the key it first registered with.
async fn register(
    settings: Settings,
    req: HttpRequest,
    payload: web::Payload,
) -> Result<impl Responder, actix_web::Error> {
    let (request, body) = read_request(&settings, &req, payload).await?;
    let Request::Register { host, finger } = &request else {
        return Err(ErrorResponse::bad_request(&req, "expected a register request").into());
    };
    log::info!("{request} from {}", peer_ip(&req));

    // The request must be signed with the key it carries.
    verify(&req, finger, &body)?;

    let mut conn = connect(&settings, &req)?;
    let existing = conn
        .agent_by_sn(host)
        .map_err(|_| ErrorResponse::internal_server_error(&req))?;

    let agent = match existing {
        None => {
            let agent = conn
                .add_agent(host, finger)
                .map_err(|_| ErrorResponse::internal_server_error(&req))?;
            log::info!("New agent {host} is waiting to be accepted");
            agent
        }
        Some(agent) => {
            if agent.key != finger.to_string() {
                log::warn!("Agent {host} registered with a different key");
                return Err(ErrorResponse::unauthorized(&req, "key mismatch").into());
            }
            let lost = conn
                .requeue_lost(agent.id)
                .map_err(|_| ErrorResponse::internal_server_error(&req))?;
            if lost > 0 {
                log::warn!("Marked {lost} unfinished task(s) of agent {host} as lost");
            }
            agent
        }
    };
    conn.touch_agent(agent.id)
        .unwrap_or_else(|e| log::warn!("Could not update last_seen of {host}: {e}"));

    if agent.enabled {
        Ok(ack(StatusCode::OK, "registered"))
    } else {
        Ok(ack(StatusCode::ACCEPTED, "waiting for acceptance"))
    }
}

/// Hands the next queued task to the agent, if any.
async fn poll(
    settings: Settings,
    req: HttpRequest,
    payload: web::Payload,
) -> Result<impl Responder, actix_web::Error> {
    let (request, body) = read_request(&settings, &req, payload).await?;
    log::debug!("{request}");

    let mut conn = connect(&settings, &req)?;
    let agent = authenticate(&mut conn, &req, request.host(), &body)?;
    conn.touch_agent(agent.id)
        .unwrap_or_else(|e| log::warn!("Could not update last_seen of {}: {e}", agent.sn));

    if !agent.enabled {
        log::debug!("Agent {} is not enabled", agent.sn);
        return Ok(HttpResponse::Ok().json(PollResponse::default()));
    }

    let task = match conn.try_dispatch_task(agent.id) {
        Ok(Some(row)) => {
            let task = row
                .agent_task()
                .map_err(|_| ErrorResponse::internal_server_error(&req))?;
            log::info!("Dispatched task {} to {}", task.id, agent.sn);
            Some(task)
        }
        Ok(None) => None,
        Err(_) => return Err(ErrorResponse::internal_server_error(&req).into()),
    };
    Ok(HttpResponse::Ok().json(PollResponse { task }))
}

/// Stores the result of a dispatched task.
async fn report(
    settings: Settings,
    req: HttpRequest,
    payload: web::Payload,
) -> Result<impl Responder, actix_web::Error> {
    let (request, body) = read_request(&settings, &req, payload).await?;
    let Request::Report {
        host,
        task,
        success,
        result,
    } = &request
    else {
        return Err(ErrorResponse::bad_request(&req, "expected a report request").into());
    };

    let mut conn = connect(&settings, &req)?;
    let agent = authenticate(&mut conn, &req, host, &body)?;
    log::info!("{request}");

    let finished = conn
        .finish_task(&task.to_string(), agent.id, *success, result)
        .map_err(|_| ErrorResponse::internal_server_error(&req))?;
    if finished.is_none() {
        log::warn!("Agent {host} reported task {task} which was not dispatched to it");
        return Err(ErrorResponse::not_found(&req, "no such dispatched task").into());
    }

    conn.add_log(agent.id, &peer_ip(&req), &task.to_string(), result)
        .map_err(|_| ErrorResponse::internal_server_error(&req))?;
    conn.touch_agent(agent.id)
        .unwrap_or_else(|e| log::warn!("Could not update last_seen of {host}: {e}"));

    Ok(ack(StatusCode::OK, &format!("task {task} received")))
}
