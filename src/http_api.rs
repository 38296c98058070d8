use esp_idf_svc::http::server::{EspHttpConnection, EspHttpServer, Method, Request};
use esp_idf_svc::io::{Read, Write};
use embedded_svc::http::Headers;
use serde::Serialize;

use velux_shutter::command::{Command, ParseError, Rejection, Target};
use velux_shutter::config::{DriveConfig, MOTOR_COUNT};

use crate::context::AppContext;

const APP_HTML: &str = include_str!("index.html");
const CORS: (&str, &str) = ("Access-Control-Allow-Origin", "*");

#[derive(Serialize)]
struct Outcome {
    motor: u8,
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

fn query_param<'a>(uri: &'a str, name: &str) -> Option<&'a str> {
    let (_, query) = uri.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn respond(
    req: Request<&mut EspHttpConnection>,
    status: u16,
    body: &str,
) -> anyhow::Result<()> {
    req.into_response(status, None, &[CORS])?
        .write_all(body.as_bytes())?;
    Ok(())
}

fn respond_outcomes(
    req: Request<&mut EspHttpConnection>,
    results: Vec<(u8, Result<(), Rejection>)>,
) -> anyhow::Result<()> {
    let status = if results.iter().any(|(_, r)| r.is_ok()) { 200 } else { 409 };
    let outcomes: Vec<Outcome> = results
        .into_iter()
        .map(|(motor, result)| Outcome {
            motor,
            accepted: result.is_ok(),
            reason: result.err().map(|r| r.to_string()),
        })
        .collect();
    respond(req, status, &serde_json::to_string(&outcomes)?)
}

fn dispatch(
    req: Request<&mut EspHttpConnection>,
    app_context: &AppContext,
    target: Target,
    param: &str,
    parse: fn(&str) -> Result<Command, ParseError>,
) -> anyhow::Result<()> {
    let uri = req.uri().to_string();
    let parsed = match query_param(&uri, param) {
        Some(value) => parse(value),
        None => {
            return respond(req, 400, &format!("Missing parameter: {}", param));
        }
    };
    match parsed {
        Ok(command) => {
            let results = app_context.fleet().dispatch(target, command);
            respond_outcomes(req, results)
        }
        Err(e) => respond(req, 400, &e.to_string()),
    }
}

pub fn register_handlers(server: &mut EspHttpServer<'_>, app_context: AppContext) -> anyhow::Result<()> {
    server.fn_handler::<anyhow::Error, _>("/", Method::Get, |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
            .write_all(APP_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/config", Method::Options, |req| {
        req.into_response(200, Some("OK"), &[
            CORS,
            ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
            ("Access-Control-Allow-Headers", "*"),
        ])?
            .write_all(&[])?;
        Ok(())
    })?;

    {
        let app_context = app_context.clone();
        server.fn_handler::<anyhow::Error, _>("/status", Method::Get, move |req| {
            let report = app_context.fleet().status();
            let json = serde_json::to_string(&report)?;
            req.into_response(200, Some("OK"), &[CORS, ("Content-Type", "application/json")])?
                .write_all(json.as_bytes())?;
            Ok(())
        })?;
    }

    for id in 1..=MOTOR_COUNT as u8 {
        {
            let app_context = app_context.clone();
            let uri = format!("/motor{}/control", id);
            server.fn_handler::<anyhow::Error, _>(&uri, Method::Get, move |req| {
                dispatch(req, &app_context, Target::Motor(id), "cmd", Command::parse_control)
            })?;
        }
        {
            let app_context = app_context.clone();
            let uri = format!("/motor{}/learn", id);
            server.fn_handler::<anyhow::Error, _>(&uri, Method::Get, move |req| {
                dispatch(req, &app_context, Target::Motor(id), "type", Command::parse_learn)
            })?;
        }
    }

    {
        let app_context = app_context.clone();
        server.fn_handler::<anyhow::Error, _>("/all/control", Method::Get, move |req| {
            dispatch(req, &app_context, Target::All, "cmd", Command::parse_control)
        })?;
    }

    {
        let app_context = app_context.clone();
        server.fn_handler::<anyhow::Error, _>("/config", Method::Get, move |req| {
            let config = app_context.storage().get_drive_config().unwrap_or_default();
            let json = serde_json::to_string(&config)?;
            req.into_response(200, Some("OK"), &[CORS, ("Content-Type", "application/json")])?
                .write_all(json.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let app_context = app_context.clone();
        server.fn_handler::<anyhow::Error, _>("/config", Method::Post, move |mut req| {
            let len = req.content_len().unwrap_or(0) as usize;
            if len > 1024 {
                return respond(req, 413, "Request too big");
            }

            let mut buf = vec![0; len];
            req.read_exact(&mut buf)?;

            match serde_json::from_slice::<DriveConfig>(&buf) {
                Ok(config) => {
                    let config = config.sanitized();
                    app_context.storage().set_drive_config(&config)?;
                    log::info!("Drive config saved over HTTP, restart to apply");
                    respond(req, 200, &serde_json::to_string(&config)?)
                }
                Err(e) => {
                    log::error!("Failed to parse config: {}", e);
                    respond(req, 400, "Bad Request")
                }
            }
        })?;
    }

    Ok(())
}
