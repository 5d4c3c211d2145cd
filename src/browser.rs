use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::dom::GetBoxModelParams;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::driver::{KeyEvent, KeyEventKind, MouseEvent, MouseEventKind, PageDriver, Point};
use crate::error::{ActionError, TransportError};
use crate::page_scripts::{dispatch_expression, PAGE_PAYLOAD, PING};
use crate::transport::{CommandMessage, ExecutionContext, PageChannel, Transport};

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (i64, i64),
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: std::env::var("PAGEPILOT_HEADFUL").is_err(),
            user_agent: None,
            viewport: (1280, 800),
        }
    }
}

/// One Chromium tab. Serves both as the host-side [`PageDriver`] and as the
/// [`ExecutionContext`] the payload script runs in.
pub struct Browser {
    page: Page,
    context_id: String,
    viewport: (i64, i64),
    _browser: OxideBrowser,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // A fresh profile per launch avoids Chromium's profile lock.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("pagepilot-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder
            .user_data_dir(profile_dir)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });

        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        Self::from_page(browser, page, cfg.viewport).await
    }

    /// Attach to a running Chromium over its DevTools websocket.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = browser.new_page("about:blank").await?;
        Self::from_page(browser, page, BrowserConfig::default().viewport).await
    }

    async fn from_page(browser: OxideBrowser, page: Page, viewport: (i64, i64)) -> Result<Self> {
        let context_id = page.target_id().inner().clone();
        let this = Self {
            page,
            context_id,
            viewport,
            _browser: browser,
        };
        // Zero-sized viewports break screenshots.
        if let Err(e) = this.force_viewport().await {
            warn!(error = %e, "could not set viewport");
        }
        Ok(this)
    }

    async fn force_viewport(&self) -> Result<()> {
        let (width, height) = self.viewport;
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(width)
            .height(height)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(params).await?;
        Ok(())
    }

    /// Transport channel into this tab's payload.
    pub fn channel(self: &Arc<Self>, transport: Arc<Transport>) -> PageChannel {
        PageChannel::new(transport, self.clone())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    pub async fn screenshot_b64(&self) -> Result<String> {
        let take = || async {
            self.page
                .screenshot(ScreenshotParamsBuilder::default().full_page(true).omit_background(true).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(STANDARD.encode(bytes)),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    self.force_viewport().await?;
                    sleep(Duration::from_millis(50)).await;
                    let bytes = take().await?;
                    return Ok(STANDARD.encode(bytes));
                }
                Err(anyhow!(e))
            }
        }
    }

    /// Screenshot as a `data:` URL for vision turns.
    pub async fn screenshot_data_url(&self) -> Result<String> {
        Ok(format!("data:image/png;base64,{}", self.screenshot_b64().await?))
    }

    async fn eval(&self, expression: &str) -> Result<Value> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| anyhow!(e))?;
        let result = self.page.evaluate_expression(params).await?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl PageDriver for Browser {
    async fn exists(&self, selector: &str) -> Result<bool, ActionError> {
        Ok(self.page.find_element(selector).await.is_ok())
    }

    async fn box_center(&self, selector: &str) -> Result<Option<Point>, ActionError> {
        let Ok(element) = self.page.find_element(selector).await else {
            return Ok(None);
        };
        let params = GetBoxModelParams::builder()
            .backend_node_id(element.backend_node_id)
            .build();
        let model = match self.page.execute(params).await {
            Ok(resp) => resp.result.model,
            Err(e) => {
                debug!(selector, error = %e, "no box model");
                return Ok(None);
            }
        };
        let quad = model.border.inner();
        if quad.len() < 6 {
            return Ok(None);
        }
        Ok(Some(Point {
            x: (quad[0] + quad[4]) / 2.0,
            y: (quad[1] + quad[5]) / 2.0,
        }))
    }

    async fn dispatch_mouse(&self, event: MouseEvent) -> Result<(), ActionError> {
        let kind = match event.kind {
            MouseEventKind::Pressed => DispatchMouseEventType::MousePressed,
            MouseEventKind::Released => DispatchMouseEventType::MouseReleased,
        };
        let params = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(event.at.x)
            .y(event.at.y)
            .button(MouseButton::Left)
            .click_count(event.click_count)
            .build()
            .map_err(ActionError::Driver)?;
        self.page
            .execute(params)
            .await
            .map_err(|e| ActionError::Driver(e.to_string()))?;
        Ok(())
    }

    async fn dispatch_key(&self, event: KeyEvent) -> Result<(), ActionError> {
        let kind = match event.kind {
            KeyEventKind::KeyDown => DispatchKeyEventType::KeyDown,
            KeyEventKind::RawKeyDown => DispatchKeyEventType::RawKeyDown,
            KeyEventKind::Char => DispatchKeyEventType::Char,
            KeyEventKind::KeyUp => DispatchKeyEventType::KeyUp,
        };
        let mut builder = DispatchKeyEventParams::builder()
            .r#type(kind)
            .modifiers(event.modifiers);
        if let Some(text) = event.text {
            builder = builder.text(text.clone()).unmodified_text(text);
        }
        if let Some(code) = event.windows_virtual_key_code {
            builder = builder.windows_virtual_key_code(code);
        }
        if !event.commands.is_empty() {
            builder = builder.commands(event.commands);
        }
        let params = builder.build().map_err(ActionError::Driver)?;
        self.page
            .execute(params)
            .await
            .map_err(|e| ActionError::Driver(e.to_string()))?;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, ActionError> {
        self.eval(expression)
            .await
            .map_err(|e| ActionError::Driver(e.to_string()))
    }

    async fn navigate(&self, url: &str) -> Result<(), ActionError> {
        let driver_err = |e: chromiumoxide::error::CdpError| ActionError::Driver(e.to_string());
        self.page.goto(url).await.map_err(driver_err)?;
        self.page.wait_for_navigation().await.map_err(driver_err)?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionContext for Browser {
    fn id(&self) -> &str {
        &self.context_id
    }

    async fn ping(&self) -> Result<bool, TransportError> {
        let alive = self
            .eval(PING)
            .await
            .map_err(|e| TransportError::Context(e.to_string()))?;
        Ok(alive.as_bool().unwrap_or(false))
    }

    async fn inject(&self) -> Result<(), TransportError> {
        self.eval(PAGE_PAYLOAD)
            .await
            .map_err(|e| TransportError::Injection(e.to_string()))?;
        Ok(())
    }

    async fn dispatch(&self, message: &CommandMessage) -> Result<Value, TransportError> {
        self.eval(&dispatch_expression(message))
            .await
            .map_err(|e| TransportError::Context(format!("{}: {e}", message.method)))
    }
}
