//! W3C WebDriver client for an Appium server.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::core::decision::{Coordinates, Selector, SelectorStrategy};
use crate::error::DriverError;
use crate::io::config::DriverConfig;
use crate::io::driver::AutomationDriver;

/// W3C element reference key.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Lookup timeout for existence probes.
const EXISTS_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(500);

const TAP_HOLD_MS: u64 = 100;

/// Map a selector to a W3C `(using, value)` locator pair.
pub fn locator(selector: &Selector) -> (&'static str, String) {
    match selector.strategy {
        SelectorStrategy::Id => ("id", selector.value.clone()),
        SelectorStrategy::Xpath => ("xpath", selector.value.clone()),
        SelectorStrategy::Text => (
            "-android uiautomator",
            format!(
                "new UiSelector().text(\"{}\")",
                selector.value.replace('"', "\\\"")
            ),
        ),
        SelectorStrategy::AccessibilityId => ("accessibility id", selector.value.clone()),
        SelectorStrategy::Class => ("class name", selector.value.clone()),
    }
}

/// Ratio between the logical window and the screenshot, per axis.
pub fn scale_ratio(window: (f64, f64), image: (u32, u32)) -> (f64, f64) {
    if image.0 == 0 || image.1 == 0 || window.0 <= 0.0 || window.1 <= 0.0 {
        return (1.0, 1.0);
    }
    (window.0 / f64::from(image.0), window.1 / f64::from(image.1))
}

fn scale(point: Coordinates, ratio: (f64, f64)) -> Coordinates {
    Coordinates::new(
        (f64::from(point.x) * ratio.0) as i32,
        (f64::from(point.y) * ratio.1) as i32,
    )
}

fn image_dimensions(png: &[u8]) -> Result<(u32, u32), DriverError> {
    image::io::Reader::new(Cursor::new(png))
        .with_guessed_format()
        .map_err(|err| DriverError::Decode(err.to_string()))?
        .into_dimensions()
        .map_err(|err| DriverError::Decode(err.to_string()))
}

fn touch_actions(steps: Vec<Value>) -> Value {
    json!({
        "actions": [{
            "type": "pointer",
            "id": "finger1",
            "parameters": { "pointerType": "touch" },
            "actions": steps,
        }]
    })
}

fn pointer_move(point: Coordinates, duration_ms: u64) -> Value {
    json!({
        "type": "pointerMove",
        "duration": duration_ms,
        "origin": "viewport",
        "x": point.x,
        "y": point.y,
    })
}

pub struct WebDriverDriver {
    client: Client,
    base_url: String,
    config: DriverConfig,
    session: Mutex<Option<String>>,
    /// Dimensions of the most recent screenshot, used for coordinate scaling.
    last_screen: Mutex<Option<(u32, u32)>>,
}

impl WebDriverDriver {
    pub fn new(config: DriverConfig) -> Result<Self, DriverError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            config,
            session: Mutex::new(None),
            last_screen: Mutex::new(None),
        })
    }

    fn session_id(&self) -> Result<String, DriverError> {
        self.session.lock().clone().ok_or(DriverError::NoSession)
    }

    fn session_request(&self, method: Method, path: &str) -> Result<RequestBuilder, DriverError> {
        let id = self.session_id()?;
        let url = format!("{}/session/{id}{path}", self.base_url);
        Ok(self.client.request(method, url))
    }

    /// Send a request and unwrap the W3C `value` envelope.
    async fn send(&self, request: RequestBuilder) -> Result<Value, DriverError> {
        let response = request.send().await?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|err| DriverError::Decode(err.to_string()))?;
        let value = body.get("value").cloned().unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(value);
        }
        let error = value.get("error").and_then(Value::as_str).unwrap_or("");
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(error)
            .to_string();
        if error == "no such element" {
            return Err(DriverError::NotFound(message));
        }
        Err(DriverError::Protocol {
            status: status.as_u16(),
            message,
        })
    }

    async fn session_call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, DriverError> {
        let mut request = self.session_request(method, path)?;
        if let Some(body) = body {
            request = request.json(&body);
        }
        self.send(request).await
    }

    /// Find an element, polling until `timeout`. `Ok(None)` when it never appears.
    async fn find_element(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<Option<String>, DriverError> {
        let (using, value) = locator(selector);
        let deadline = Instant::now() + timeout;
        loop {
            let found = self
                .session_call(
                    Method::POST,
                    "/element",
                    Some(json!({ "using": using, "value": value })),
                )
                .await;
            match found {
                Ok(element) => {
                    return element
                        .get(ELEMENT_KEY)
                        .and_then(Value::as_str)
                        .map(|id| Some(id.to_string()))
                        .ok_or_else(|| DriverError::Decode("element reference missing".into()));
                }
                Err(DriverError::NotFound(_)) if Instant::now() < deadline => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(DriverError::NotFound(_)) => {
                    debug!(using, value = %value, "element not found");
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn active_element(&self) -> Result<String, DriverError> {
        let element = self
            .session_call(Method::GET, "/element/active", None)
            .await?;
        element
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DriverError::NotFound("no focused element".into()))
    }

    fn element_timeout(&self) -> Duration {
        Duration::from_secs(self.config.element_timeout_secs)
    }

    async fn scale_ratio(&self) -> Result<(f64, f64), DriverError> {
        let rect = self.session_call(Method::GET, "/window/rect", None).await?;
        let window = (
            rect.get("width").and_then(Value::as_f64).unwrap_or(0.0),
            rect.get("height").and_then(Value::as_f64).unwrap_or(0.0),
        );
        let cached = *self.last_screen.lock();
        let image = match cached {
            Some(dims) => dims,
            None => image_dimensions(&self.screenshot().await?)?,
        };
        Ok(scale_ratio(window, image))
    }

    async fn perform(&self, steps: Vec<Value>) -> Result<(), DriverError> {
        self.session_call(Method::POST, "/actions", Some(touch_actions(steps)))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AutomationDriver for WebDriverDriver {
    #[instrument(skip_all, fields(server = %self.base_url))]
    async fn start_session(&self, app: &str) -> Result<(), DriverError> {
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "platformName": self.config.platform_name,
                    "appium:automationName": self.config.automation_name,
                    "appium:app": app,
                    "appium:noReset": false,
                    "appium:autoGrantPermissions": true,
                    "appium:appWaitActivity": "*",
                    "appium:appWaitDuration": self.config.app_wait_duration_ms,
                }
            }
        });
        let request = self
            .client
            .post(format!("{}/session", self.base_url))
            .json(&capabilities);
        let value = self.send(request).await?;
        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Decode("sessionId missing".into()))?;
        info!(session_id = %id, "session started");
        *self.session.lock() = Some(id.to_string());
        *self.last_screen.lock() = None;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        let value = self.session_call(Method::GET, "/screenshot", None).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| DriverError::Decode("screenshot is not a string".into()))?;
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = STANDARD
            .decode(compact)
            .map_err(|err| DriverError::Decode(err.to_string()))?;
        match image_dimensions(&bytes) {
            Ok(dims) => *self.last_screen.lock() = Some(dims),
            Err(err) => debug!(error = %err, "screenshot dimensions unavailable"),
        }
        Ok(bytes)
    }

    async fn ui_tree(&self) -> Result<String, DriverError> {
        let value = self.session_call(Method::GET, "/source", None).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DriverError::Decode("page source is not a string".into()))
    }

    async fn click(&self, selector: &Selector) -> Result<bool, DriverError> {
        let Some(element) = self.find_element(selector, self.element_timeout()).await? else {
            return Ok(false);
        };
        self.session_call(Method::POST, &format!("/element/{element}/click"), Some(json!({})))
            .await?;
        debug!(selector = %selector.value, "clicked element");
        Ok(true)
    }

    async fn type_text(
        &self,
        target: Option<&Selector>,
        text: &str,
    ) -> Result<bool, DriverError> {
        let element = match target {
            Some(selector) => match self.find_element(selector, self.element_timeout()).await? {
                Some(element) => element,
                None => return Ok(false),
            },
            None => self.active_element().await?,
        };
        self.session_call(Method::POST, &format!("/element/{element}/clear"), Some(json!({})))
            .await?;
        self.session_call(
            Method::POST,
            &format!("/element/{element}/value"),
            Some(json!({ "text": text })),
        )
        .await?;
        Ok(true)
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        let point = scale(Coordinates::new(x, y), self.scale_ratio().await?);
        debug!(x, y, logical_x = point.x, logical_y = point.y, "coordinate tap");
        self.perform(vec![
            pointer_move(point, 0),
            json!({ "type": "pointerDown", "button": 0 }),
            json!({ "type": "pause", "duration": TAP_HOLD_MS }),
            json!({ "type": "pointerUp", "button": 0 }),
        ])
        .await
    }

    async fn swipe(
        &self,
        from: Coordinates,
        to: Coordinates,
        duration: Duration,
    ) -> Result<(), DriverError> {
        let ratio = self.scale_ratio().await?;
        self.perform(vec![
            pointer_move(scale(from, ratio), 0),
            json!({ "type": "pointerDown", "button": 0 }),
            pointer_move(scale(to, ratio), duration.as_millis() as u64),
            json!({ "type": "pointerUp", "button": 0 }),
        ])
        .await
    }

    async fn element_exists(&self, selector: &Selector) -> Result<bool, DriverError> {
        let timeout = EXISTS_TIMEOUT.min(self.element_timeout());
        Ok(self.find_element(selector, timeout).await?.is_some())
    }

    async fn quit(&self) -> Result<(), DriverError> {
        let Some(id) = self.session.lock().take() else {
            return Ok(());
        };
        let request = self
            .client
            .delete(format!("{}/session/{id}", self.base_url));
        match self.send(request).await {
            Ok(_) => {
                info!(session_id = %id, "session closed");
                Ok(())
            }
            Err(err) => {
                warn!(session_id = %id, error = %err, "closing session failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        image::DynamicImage::new_rgba8(width, height)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
            .expect("encode png");
        bytes
    }

    fn driver(server: &MockServer) -> WebDriverDriver {
        WebDriverDriver::new(DriverConfig {
            server_url: server.base_url(),
            element_timeout_secs: 0,
            ..DriverConfig::default()
        })
        .expect("client")
    }

    async fn start(server: &MockServer, driver: &WebDriverDriver) {
        server
            .mock_async(|when, then| {
                when.method(POST).path("/session");
                then.status(200)
                    .json_body(json!({ "value": { "sessionId": "s1", "capabilities": {} } }));
            })
            .await;
        driver.start_session("app.apk").await.expect("session");
    }

    #[test]
    fn locators_follow_selector_strategy() {
        assert_eq!(locator(&Selector::id("login")), ("id", "login".to_string()));
        assert_eq!(
            locator(&Selector::new(SelectorStrategy::Text, "Sign in")),
            ("-android uiautomator", "new UiSelector().text(\"Sign in\")".to_string())
        );
        assert_eq!(
            locator(&Selector::new(SelectorStrategy::AccessibilityId, "menu")).0,
            "accessibility id"
        );
        assert_eq!(
            locator(&Selector::new(SelectorStrategy::Class, "android.widget.Button")).0,
            "class name"
        );
    }

    #[test]
    fn scale_ratio_maps_pixels_to_window() {
        assert_eq!(scale_ratio((540.0, 1200.0), (1080, 2400)), (0.5, 0.5));
        assert_eq!(scale_ratio((540.0, 1200.0), (0, 0)), (1.0, 1.0));
        assert_eq!(
            scale(Coordinates::new(200, 400), (0.5, 0.5)),
            Coordinates::new(100, 200)
        );
    }

    #[test]
    fn reads_png_dimensions() {
        assert_eq!(image_dimensions(&png(12, 30)).expect("dims"), (12, 30));
    }

    #[tokio::test]
    async fn calls_without_session_fail() {
        let server = MockServer::start_async().await;
        let driver = driver(&server);
        assert!(matches!(driver.ui_tree().await, Err(DriverError::NoSession)));
        // Quitting without a session is a no-op.
        driver.quit().await.expect("quit");
    }

    #[tokio::test]
    async fn starts_session_and_reads_screen() {
        let server = MockServer::start_async().await;
        let driver = driver(&server);
        start(&server, &driver).await;

        let png = png(12, 30);
        server
            .mock_async(|when, then| {
                when.method(GET).path("/session/s1/screenshot");
                then.status(200).json_body(json!({ "value": STANDARD.encode(&png) }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/session/s1/source");
                then.status(200).json_body(json!({ "value": "<hierarchy/>" }));
            })
            .await;

        assert_eq!(driver.screenshot().await.expect("screenshot"), png);
        assert_eq!(*driver.last_screen.lock(), Some((12, 30)));
        assert_eq!(driver.ui_tree().await.expect("tree"), "<hierarchy/>");
    }

    #[tokio::test]
    async fn missing_element_is_reported_as_false() {
        let server = MockServer::start_async().await;
        let driver = driver(&server);
        start(&server, &driver).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/session/s1/element");
                then.status(404).json_body(json!({
                    "value": { "error": "no such element", "message": "not here" }
                }));
            })
            .await;

        let selector = Selector::id("missing");
        assert!(!driver.element_exists(&selector).await.expect("probe"));
        assert!(!driver.click(&selector).await.expect("click"));
    }

    #[tokio::test]
    async fn clicks_found_element() {
        let server = MockServer::start_async().await;
        let driver = driver(&server);
        start(&server, &driver).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/session/s1/element");
                then.status(200)
                    .json_body(json!({ "value": { ELEMENT_KEY: "e1" } }));
            })
            .await;
        let click = server
            .mock_async(|when, then| {
                when.method(POST).path("/session/s1/element/e1/click");
                then.status(200).json_body(json!({ "value": null }));
            })
            .await;

        assert!(driver.click(&Selector::id("login")).await.expect("click"));
        click.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_become_protocol_errors() {
        let server = MockServer::start_async().await;
        let driver = driver(&server);
        start(&server, &driver).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/session/s1/source");
                then.status(500).json_body(json!({
                    "value": { "error": "unknown error", "message": "boom" }
                }));
            })
            .await;

        let err = driver.ui_tree().await.expect_err("should fail");
        assert!(matches!(err, DriverError::Protocol { status: 500, ref message } if message == "boom"));
    }

    #[tokio::test]
    async fn quit_deletes_session_once() {
        let server = MockServer::start_async().await;
        let driver = driver(&server);
        start(&server, &driver).await;
        let delete = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/session/s1");
                then.status(200).json_body(json!({ "value": null }));
            })
            .await;

        driver.quit().await.expect("quit");
        driver.quit().await.expect("second quit is a no-op");
        delete.assert_async().await;
    }
}
