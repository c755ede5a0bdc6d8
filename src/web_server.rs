use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};
use sqlx::sqlite::SqlitePool;

use crate::config::ServerConfig;
use crate::queue::JobQueue;
use crate::routes::{
    get_queue_status_handler, get_submission_handler, json_error_handler, post_submission_handler,
};

pub fn build_server(
    server_config: ServerConfig,
    db_pool: Arc<SqlitePool>,
    queue: Arc<JobQueue>,
) -> std::io::Result<Server> {
    let db_pool = web::Data::new(db_pool);
    let queue = web::Data::new(queue);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(db_pool.clone())
            .app_data(queue.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(web::resource("/submissions").route(web::post().to(post_submission_handler)))
            .service(
                web::resource("/submissions/{id}").route(web::get().to(get_submission_handler)),
            )
            .service(web::resource("/queue/status").route(web::get().to(get_queue_status_handler)))
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
