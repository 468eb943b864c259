use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use std::sync::Arc;

use iso_newsletter::app;
use iso_newsletter::config::app_config::AppConfig;
use iso_newsletter::logger::init_logger;
use iso_newsletter::services::dispatch_service::DispatchService;
use iso_newsletter::services::mail_transport::{MailTransport, SmtpMailer};
use iso_newsletter::services::newsletter_service::NewsletterService;
use iso_newsletter::services::newsletter_store::NewsletterStore;
use iso_newsletter::services::template_service::TemplateService;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok(); // Cargar .env al inicio
    init_logger();

    let config = AppConfig::from_env().context("Configuración inválida")?;
    log::info!("Configuración cargada: {:?}", config.smtp);

    // Conectarnos a la DB y aplicar migraciones
    let store = NewsletterStore::connect(&config.database).await?;
    store
        .run_migrations()
        .await
        .context("Fallo en migraciones del newsletter")?;

    // Plantillas: un error de sintaxis aborta el arranque
    let renderer = TemplateService::from_config(&config.template)?;

    let mailer = SmtpMailer::new(&config.smtp, config.dispatch.workers as u32)?;
    let transport: Arc<dyn MailTransport> = Arc::new(mailer);

    let dispatch_service = DispatchService::new(
        store.clone(),
        renderer,
        transport,
        config.smtp.from_address.clone(),
        config.dispatch.clone(),
    );
    let newsletter_service = NewsletterService::new(store.clone(), dispatch_service);

    // Envíos que quedaron en pending por un apagado brusco
    match newsletter_service
        .reconcile_stale_pending(config.dispatch.stale_pending_after)
        .await
    {
        Ok(n) if n > 0 => log::warn!("{} envíos pending reconciliados al arrancar", n),
        Ok(_) => {}
        Err(e) => log::error!("No se pudo reconciliar pending al arrancar: {:#}", e),
    }

    let bind = (config.server.host.clone(), config.server.port);
    log::info!("Levantando servidor en {}:{}", bind.0, bind.1);
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(newsletter_service.clone()))
            .configure(app::init_app)
    })
    .workers(1)
    .bind(bind)?
    .run()
    .await?;

    Ok(())
}
