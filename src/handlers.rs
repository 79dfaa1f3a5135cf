use actix_web::body::SizedStream;
use actix_web::http::header::{
    self, Charset, ContentDisposition, ContentType, DispositionParam, DispositionType, ExtendedValue,
};
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::Deserialize;
use tera::{Context, Tera};

use crate::delivery::{Delivery, Outcome, RequestParameters};
use crate::extract::MediaFormat;
use crate::flash;
use crate::state::AppState;

const INDEX_TEMPLATE: &str = "index.html";

/// Page templates, compiled into the binary. `.html` names are auto-escaped.
pub fn templates() -> tera::Result<Tera> {
    let mut tera = Tera::default();
    tera.add_raw_template(INDEX_TEMPLATE, include_str!("../templates/index.html"))?;
    Ok(tera)
}

#[derive(Deserialize)]
pub struct DownloadForm {
    #[serde(default)]
    pub url: String,
    // "video" (default) or "audio"
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub filename: String,
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(index)))
        .service(web::resource("/download").route(web::post().to(download)));
}

pub async fn index(req: HttpRequest, state: web::Data<AppState>) -> impl Responder {
    let message = flash::read(&req, &state.flash_key);

    let mut ctx = Context::new();
    ctx.insert("message", &message);
    let page = match state.templates.render(INDEX_TEMPLATE, &ctx) {
        Ok(page) => page,
        Err(e) => {
            log::error!("[INDEX] Failed to render {}: {:?}", INDEX_TEMPLATE, e);
            return HttpResponse::InternalServerError().finish();
        }
    };

    let mut resp = HttpResponse::Ok();
    resp.content_type(ContentType::html())
        .append_header((header::CACHE_CONTROL, "no-store"));
    if req.cookie(flash::FLASH_COOKIE).is_some() {
        resp.cookie(flash::removal());
    }
    resp.body(page)
}

pub async fn download(form: web::Form<DownloadForm>, state: web::Data<AppState>) -> impl Responder {
    let form = form.into_inner();
    let custom_name = form.filename.trim();
    let params = RequestParameters {
        url: form.url.trim().to_string(),
        media_format: MediaFormat::from_form_value(&form.format),
        custom_name: (!custom_name.is_empty()).then(|| custom_name.to_string()),
    };

    log::info!(
        "[DOWNLOAD] Request: format={:?} url={}",
        params.media_format,
        params.url
    );

    match state.pipeline.handle_request(params).await {
        Outcome::Success(delivery) => attachment(delivery),
        Outcome::Failure(message) => {
            let mut resp = HttpResponse::SeeOther();
            resp.append_header((header::LOCATION, "/"));
            if let Some(cookie) = flash::signed(&state.flash_key, &message) {
                resp.cookie(cookie);
            }
            resp.finish()
        }
    }
}

fn attachment(delivery: Delivery) -> HttpResponse {
    let Delivery {
        filename,
        content_type,
        len,
        body,
    } = delivery;

    let mut parameters = vec![DispositionParam::Filename(filename.clone())];
    if !filename.is_ascii() {
        parameters.push(DispositionParam::FilenameExt(ExtendedValue {
            charset: Charset::Ext("UTF-8".to_string()),
            language_tag: None,
            value: filename.into_bytes(),
        }));
    }

    // SizedStream sets Content-Length; the workspace goes away when the body is done or dropped.
    HttpResponse::Ok()
        .content_type(content_type)
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters,
        })
        .append_header((header::CACHE_CONTROL, "no-store"))
        .body(SizedStream::new(len, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::delivery::DeliveryPipeline;
    use crate::error::{Error, Result};
    use crate::extract::{EngineReport, ExtractionEngine, ExtractionJob, PostProcess};
    use crate::workspace::WorkspaceManager;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct FakeEngine {
        title: &'static str,
        fail: Option<&'static str>,
    }

    #[async_trait]
    impl ExtractionEngine for FakeEngine {
        async fn run(&self, job: &ExtractionJob) -> Result<EngineReport> {
            if let Some(cause) = self.fail {
                return Err(Error::Extraction(cause.to_string()));
            }
            let ext = match job.post_process {
                PostProcess::ExtractAudio { codec, .. } => codec,
                PostProcess::Merge { container } => container,
            };
            let path = job
                .output_template
                .parent()
                .unwrap()
                .join(format!("{}.{}", self.title, ext));
            std::fs::write(&path, b"0123456789").unwrap();
            Ok(EngineReport {
                title: Some(self.title.to_string()),
                filepath: Some(path),
            })
        }
    }

    fn state(root: &Path, engine: FakeEngine) -> web::Data<AppState> {
        let config = AppConfig::default();
        let pipeline = DeliveryPipeline::new(
            WorkspaceManager::new(root, "bili-download-"),
            Arc::new(engine),
            config.allowed_domains.clone(),
        );
        web::Data::new(AppState::with_pipeline(config, pipeline).unwrap())
    }

    fn entries(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    #[actix_web::test]
    async fn index_renders_form() {
        let root = tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(state(root.path(), FakeEngine { title: "x", fail: None }))
                .configure(routes),
        )
        .await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains(r#"action="/download""#));
        assert!(!body.contains("{{"));
        assert!(!body.contains("{%"));
        assert!(!body.contains(r#"class="flash""#));
    }

    #[actix_web::test]
    async fn download_streams_attachment_and_cleans_up() {
        let root = tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(state(root.path(), FakeEngine { title: "My Clip", fail: None }))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/download")
            .set_form([
                ("url", " https://bilibili.com/video/xyz "),
                ("format", "audio"),
                ("filename", "My:Song*"),
            ])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let headers = resp.headers();
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "audio/mpeg");
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-store");
        let disposition = headers
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment"));
        assert!(disposition.contains(r#"filename="MySong.mp3""#));
        assert_eq!(entries(root.path()).len(), 1);

        let body = test::read_body(resp).await;
        assert_eq!(&body[..], b"0123456789");
        assert!(entries(root.path()).is_empty());
    }

    #[actix_web::test]
    async fn non_ascii_names_get_extended_parameter() {
        let root = tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(state(root.path(), FakeEngine { title: "春日影", fail: None }))
                .configure(routes),
        )
        .await;
        let req = test::TestRequest::post()
            .uri("/download")
            .set_form([("url", "https://www.bilibili.com/video/BV1xx"), ("format", "video")])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let disposition = resp.headers().get(header::CONTENT_DISPOSITION).unwrap().as_bytes().to_vec();
        let disposition = String::from_utf8_lossy(&disposition).to_string();
        assert!(disposition.contains("filename*=UTF-8''"));
        test::read_body(resp).await;
        assert!(entries(root.path()).is_empty());
    }

    #[actix_web::test]
    async fn failure_redirects_with_flash_message() {
        let root = tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(state(
                    root.path(),
                    FakeEngine {
                        title: "x",
                        fail: Some("Unable to download webpage: <urlopen error>; please report this issue (100%)"),
                    },
                ))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/download")
            .set_form([("url", "https://bilibili.com/video/xyz"), ("format", "video")])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/");
        assert!(entries(root.path()).is_empty());

        let cookie = resp
            .response()
            .cookies()
            .find(|c| c.name() == flash::FLASH_COOKIE)
            .expect("flash cookie")
            .into_owned();

        let req = test::TestRequest::get().uri("/").cookie(cookie).to_request();
        let resp = test::call_service(&app, req).await;
        let cleared = resp
            .response()
            .cookies()
            .find(|c| c.name() == flash::FLASH_COOKIE)
            .expect("flash cookie cleared");
        assert_eq!(cleared.value(), "");
        let body = test::read_body(resp).await;
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains(
            "Download failed: Unable to download webpage: &lt;urlopen error&gt;; please report this issue (100%)"
        ));
    }

    #[actix_web::test]
    async fn missing_url_creates_no_workspace() {
        let root = tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(state(root.path(), FakeEngine { title: "x", fail: None }))
                .configure(routes),
        )
        .await;

        for form in [vec![("url", ""), ("format", "video")], vec![("format", "audio")]] {
            let req = test::TestRequest::post()
                .uri("/download")
                .set_form(form)
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::SEE_OTHER);
            assert!(entries(root.path()).is_empty());
        }
    }
}
