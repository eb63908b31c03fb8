// Agent side of the master API
// https://docs.rs/reqwest/latest/reqwest/

use reqwest::{
    self,
    header::{HeaderMap, HeaderValue},
    Client as ReqwestClient,
};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::{
    env,
    error::Error,
    key::Key,
    payload::{AgentTask, TaskReport},
    protocol::{Ack, PollResponse, Request, SIGNATURE_HEADER},
    settings::Settings,
};

fn common_headers(key: &Key, body: &[u8]) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", HeaderValue::from_static("application/json"));
    headers.insert(
        "User-Agent",
        env::version_string().parse().map_err(|_| {
            log::error!("Could not convert version string to header value");
            Error::from("Invalid header value")
        })?,
    );
    headers.insert(
        SIGNATURE_HEADER,
        key.sign(body)?.parse().map_err(|_| {
            log::error!("Could not convert signature to header value");
            Error::from("Invalid header value")
        })?,
    );
    Ok(headers)
}

fn endpoint_url(settings: &Settings, req: &Request) -> String {
    format!(
        "{}{}",
        settings.master.public_url.trim_end_matches('/'),
        req.endpoint()
    )
}

/// Posts a signed request and decodes the JSON answer.
async fn post<T: DeserializeOwned>(settings: &Settings, key: &Key, req: &Request) -> Result<T, Error> {
    let body = serde_json::to_vec(req)?;
    let c = ReqwestClient::new();
    let response = c
        .post(endpoint_url(settings, req))
        .headers(common_headers(key, &body)?)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            log::error!("Error sending {} request: {e}", req.endpoint());
            e
        })?;

    if response.status().is_success() {
        Ok(response.json::<T>().await?)
    } else {
        let errmsg = format!(
            "Non-OK response code {} from {}: {}",
            response.status(),
            req.endpoint(),
            response
                .text()
                .await
                .unwrap_or("no text received".to_string())
        );
        log::error!("{}", errmsg);
        Err(Error::from(errmsg))
    }
}

/// Announces this agent and its key to the master.
pub async fn register(settings: &Settings, key: &Key) -> Result<Ack, Error> {
    let req = Request::Register {
        host: settings.agent.id.clone(),
        finger: key.clone(),
    };
    post(settings, key, &req).await
}

/// Asks the master for the next task of this agent.
pub async fn poll(settings: &Settings, key: &Key) -> Result<Option<AgentTask>, Error> {
    let req = Request::Poll {
        host: settings.agent.id.clone(),
    };
    let ret: PollResponse = post(settings, key, &req).await?;
    Ok(ret.task)
}

pub async fn report(
    settings: &Settings,
    key: &Key,
    task: Uuid,
    report: &TaskReport,
) -> Result<Ack, Error> {
    let req = Request::Report {
        host: settings.agent.id.clone(),
        task,
        success: report.success,
        result: report.result.clone(),
    };
    post(settings, key, &req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    #[test]
    fn test_signed_headers() {
        let key = Key::generate();
        let body = br#"{"poll":{"host":"web-01"}}"#;
        let headers = common_headers(&key, body).unwrap();
        let sig = headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
        assert_that!(key.verify(body, sig)).is_true();
        assert_that!(headers.get("User-Agent").unwrap().to_str().unwrap())
            .is_equal_to(env::version_string().as_str());
    }
}
