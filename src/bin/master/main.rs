use actix_web::{web, App, HttpRequest, HttpServer, Responder};
use axis::{db::conn::DatabaseConnection, error::Error, settings::Settings};

use clap::Parser;

mod api;
mod route;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML file containing the program settings
    #[arg(short, long)]
    settings: String,
}

async fn not_found(req: HttpRequest) -> Result<impl Responder, actix_web::Error> {
    if req.path().starts_with("/api") {
        api::not_found(req)
    } else {
        route::not_found()
    }
}

#[actix_web::main]
async fn main() -> Result<(), Error> {
    let args: Args = Args::parse();
    let s = Settings::load(&args.settings)?;
    s.setup_logging("master")?;

    // Agents cannot register before the tables exist.
    DatabaseConnection::connect(&s)?.setup_schema()?;

    log::info!("Listening on {}:{}", s.master.address, s.master.port);
    let s_clone1 = s.clone();
    HttpServer::new(move || {
        let s = s_clone1.clone();
        App::new()
            .configure(|cfg| route::config(cfg, &s))
            .configure(|cfg| api::config(cfg, &s))
            .default_service(web::to(not_found))
    })
    .bind((s.master.address.as_str(), s.master.port))?
    .run()
    .await
    .map_err(Error::from)
}
