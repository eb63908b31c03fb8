use actix_web::{
    error::InternalError,
    http::StatusCode,
    web::{self, ServiceConfig},
    HttpResponse, HttpResponseBuilder,
};
use sailfish::TemplateSimple;

use axis::{env, settings::Settings, utils::systemtime_to_utc_string};

// SAILFISH_ variables are used inside the templates
static SAILFISH_HEADER_BAR_ROUTES: [(&str, &str); 1] = [("/", "Status")];
static SAILFISH_HEADER_BAR_TITLE: &str = "axis master";
static SAILFISH_TITLE_PREFIX: &str = "axis | ";

/// Number of tasks shown on the status page
const RECENT_TASKS: i64 = 100;

pub fn config(cfg: &mut ServiceConfig, settings: &Settings) {
    let s = settings.clone();
    cfg.route("/", web::get().to(move || get_index(s.clone())));
}

/// Default page to use if not found
#[derive(TemplateSimple)]
#[template(path = "error/message.stpl")]
struct ErrorMessageTemplate {
    // Common
    title: String,
    current_route: Option<String>,
    // Message to show on the page
    msg: String,
}

impl ErrorMessageTemplate {
    /// Renders a 404 not found page
    pub fn not_found() -> Result<HttpResponse, actix_web::Error> {
        ErrorMessageTemplate {
            title: String::from("404: Not Found"),
            current_route: None,
            msg: String::from("404: Not Found \u{2639}"),
        }
        .render_errmsg_template(HttpResponse::NotFound())
    }
    /// Renders a 500 page
    pub fn internal_server_error() -> Result<HttpResponse, actix_web::Error> {
        ErrorMessageTemplate {
            title: String::from("500: Internal Server Error"),
            current_route: None,
            msg: String::from("500: Internal Server Error"),
        }
        .render_errmsg_template(HttpResponse::InternalServerError())
    }

    fn render_errmsg_template(
        self,
        mut resp: HttpResponseBuilder,
    ) -> Result<HttpResponse, actix_web::Error> {
        let body: String = self
            .render_once()
            .map_err(|e| InternalError::new(e, StatusCode::INTERNAL_SERVER_ERROR))?;

        Ok(resp.body(body))
    }
}

/// this function is configured in main.rs
pub fn not_found() -> Result<HttpResponse, actix_web::Error> {
    ErrorMessageTemplate::not_found()
}

/// Status page listing agents and the latest tasks
#[derive(TemplateSimple)]
#[template(path = "route/index.stpl")]
struct IndexTemplate {
    // Common
    title: String,
    current_route: Option<String>,
    // For this template only
    version: String,
    agents: Vec<AgentInfo>,
    tasks: Vec<TaskInfo>,
}

struct AgentInfo {
    sn: String,
    enabled: bool,
    last_seen: String,
    created_at: String,
}

struct TaskInfo {
    uuid: String,
    agent: String,
    status: String,
    /// span class of the status cell
    status_class: &'static str,
    date_queued: String,
    date_finished: String,
}

async fn get_index(settings: Settings) -> Result<HttpResponse, actix_web::Error> {
    use axis::db::{conn::DatabaseConnection, models::TaskStatusCode as TSC};

    let mut conn = match DatabaseConnection::connect(&settings) {
        Ok(conn) => conn,
        Err(e) => {
            log::error!("Could not open database connection: {e}");
            return ErrorMessageTemplate::internal_server_error();
        }
    };
    let (agents, tasks) = match (conn.list_agents(), conn.recent_tasks(RECENT_TASKS)) {
        (Ok(agents), Ok(tasks)) => (agents, tasks),
        _ => return ErrorMessageTemplate::internal_server_error(),
    };

    let fmt_time = |t: &Option<std::time::SystemTime>| {
        t.as_ref()
            .and_then(systemtime_to_utc_string)
            .unwrap_or("-".to_string())
    };

    let tpl = IndexTemplate {
        title: format!("Status"),
        current_route: Some(String::from("/")),
        version: env::version_string(),
        agents: agents
            .iter()
            .map(|a| AgentInfo {
                sn: a.sn.clone(),
                enabled: a.enabled,
                last_seen: fmt_time(&a.last_seen),
                created_at: fmt_time(&Some(a.created_at)),
            })
            .collect(),
        tasks: tasks
            .iter()
            .map(|(t, sn)| TaskInfo {
                uuid: t.uuid.clone(),
                agent: sn.clone(),
                status: t.status().map_or("Unknown".to_string(), |c| format!("{c}")),
                status_class: match t.status() {
                    Some(TSC::Success) => "text-success-emphasis",
                    Some(TSC::Failed) | Some(TSC::Lost) => "text-danger-emphasis",
                    _ => "text-body-secondary",
                },
                date_queued: fmt_time(&Some(t.date_queued)),
                date_finished: fmt_time(&t.date_finished),
            })
            .collect(),
    };
    let body: String = tpl
        .render_once()
        .map_err(|e| InternalError::new(e, StatusCode::INTERNAL_SERVER_ERROR))?;

    Ok(HttpResponse::Ok().body(body))
}
