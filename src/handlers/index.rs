use crate::bridge::CONNECTED_MESSAGE;
use crate::state::AppState;
use actix_web::{http::header::ContentType, web, HttpResponse};

const INDEX_TEMPLATE: &str = include_str!("../../static/index.html");

/// Fill the page template with the sample rate the browser must capture at
/// and the status that marks the session ready.
pub fn render_index(sample_rate: u32) -> String {
    INDEX_TEMPLATE
        .replace("{{ sample_rate }}", &sample_rate.to_string())
        .replace("{{ connected_message }}", CONNECTED_MESSAGE)
}

/// Browser client page.
pub async fn index(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type(ContentType::html())
        .body(render_index(state.config.bridge.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[::core::prelude::v1::test]
    fn test_render_index_substitutes_sample_rate() {
        let page = render_index(16000);
        assert!(page.contains("const SAMPLE_RATE = 16000;"));
        assert!(!page.contains("{{ sample_rate }}"));
    }

    #[::core::prelude::v1::test]
    fn test_start_reenabled_only_by_connected_status_or_done() {
        let page = render_index(24000);
        assert!(page.contains(&format!("const CONNECTED_MESSAGE = \"{}\";", CONNECTED_MESSAGE)));
        assert!(!page.contains("{{ connected_message }}"));

        // Only two places turn the Start button back on
        assert_eq!(page.matches("startBtn.disabled = false").count(), 2);
        assert!(page.contains("if (msg.message === CONNECTED_MESSAGE) {"));
    }

    #[actix_web::test]
    async fn test_index_serves_html() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(AppConfig::default())))
                .route("/", web::get().to(index)),
        )
        .await;

        let req = test::TestRequest::get().uri("/").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/html; charset=utf-8"
        );

        let body = test::read_body(resp).await;
        let page = std::str::from_utf8(&body).unwrap();
        assert!(page.contains("const SAMPLE_RATE = 24000;"));
    }
}
