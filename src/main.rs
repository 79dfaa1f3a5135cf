use actix_web::{web, App, HttpServer};

use bili_fetch::{handlers, AppConfig, AppState};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let explicit = std::env::args()
        .skip_while(|a| a != "--config")
        .nth(1);
    let required = explicit.is_some();
    let cfg_path = explicit.unwrap_or_else(|| "config.toml".to_string());

    let cfg = match AppConfig::load(&cfg_path, required).and_then(|mut c| c.apply_env().map(|_| c)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[CONFIG] Failed to load {}: {:#}", cfg_path, e);
            std::process::exit(1);
        }
    };

    println!("========================================");
    println!("  Bilibili Download Service");
    println!("  http://{}", cfg.listen_addr);
    println!("========================================");
    println!();

    log::info!(
        "[CONFIG] allowed_domains={:?} workspace_root={}",
        cfg.allowed_domains,
        cfg.workspace_root.display()
    );

    let state = match AppState::new(cfg) {
        Ok(s) => web::Data::new(s),
        Err(e) => {
            eprintln!("[STARTUP] {:#}", e);
            std::process::exit(1);
        }
    };

    let bind_addr = state.config.listen_addr.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(state.clone())
            .configure(handlers::routes)
    })
    .bind(bind_addr.as_str())?
    .run()
    .await
}
