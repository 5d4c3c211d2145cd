use std::env;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::action::{Action, ScrollDirection, TargetRef};
use crate::driver::{KeyEvent, MouseEvent, MouseEventKind, PageDriver, Point, SHIFT};
use crate::error::{ActionError, ResolutionError};
use crate::events::{EventBus, PilotEvent};
use crate::page_scripts::{broad_scan_expression, scroll_expression, HTML_LENGTH};
use crate::resolver::{Resolver, ResolverConfig, SelectorSource};
use crate::transport::PageChannel;

/// Fixed delays around synthesized input. Page handlers that validate on
/// keystrokes depend on these being real pauses.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub press_release_gap: Duration,
    pub after_click: Duration,
    /// Split evenly between key-down and key-up.
    pub keystroke: Duration,
    pub after_select_all: Duration,
    pub after_scroll: Duration,
    pub wait: Duration,
    pub stable_interval: Duration,
    pub stable_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            press_release_gap: Duration::from_millis(20),
            after_click: Duration::from_millis(500),
            keystroke: Duration::from_millis(10),
            after_select_all: Duration::from_millis(200),
            after_scroll: Duration::from_millis(300),
            wait: Duration::from_millis(
                env::var("PAGEPILOT_WAIT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3_000),
            ),
            stable_interval: Duration::from_millis(500),
            stable_timeout: Duration::from_secs(10),
        }
    }
}

impl ExecutorConfig {
    /// No pauses at all; for driving fakes.
    pub fn immediate() -> Self {
        Self {
            press_release_gap: Duration::ZERO,
            after_click: Duration::ZERO,
            keystroke: Duration::ZERO,
            after_select_all: Duration::ZERO,
            after_scroll: Duration::ZERO,
            wait: Duration::ZERO,
            stable_interval: Duration::ZERO,
            stable_timeout: Duration::ZERO,
        }
    }
}

/// Carries out one [`Action`] at a time against a page.
pub struct ActionExecutor {
    driver: Arc<dyn PageDriver>,
    channel: PageChannel,
    resolver: Resolver,
    cfg: ExecutorConfig,
    events: EventBus,
}

impl ActionExecutor {
    pub fn new(driver: Arc<dyn PageDriver>, channel: PageChannel, cfg: ExecutorConfig) -> Self {
        let resolver = Resolver::new(Arc::new(channel.clone()), driver.clone(), ResolverConfig::default());
        Self {
            driver,
            channel,
            resolver,
            cfg,
            events: EventBus::new(),
        }
    }

    pub fn with_selector_source(mut self, source: Arc<dyn SelectorSource>, cfg: ResolverConfig) -> Self {
        self.resolver = Resolver::new(source, self.driver.clone(), cfg);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub async fn execute(&self, action: &Action) -> Result<(), ActionError> {
        self.events.publish(PilotEvent::ActionStarted { action: action.clone() });
        info!(action = action.name(), "executing action");
        let result = match action {
            Action::Click { target_id } => self.click(target_id).await,
            Action::SetValue { target_id, value } => self.set_value(target_id, value).await,
            Action::SetValueAndEnter { target_id, value } => self.set_value_and_enter(target_id, value).await,
            Action::Navigate { url } => self.navigate(url).await,
            Action::Scroll { direction } => self.scroll(*direction).await,
            Action::Wait => self.wait().await,
            Action::Finish | Action::Fail => Ok(()),
        };
        if let Err(err) = &result {
            warn!(action = action.name(), error = %err, "action failed");
            self.events.publish(PilotEvent::ActionFailed {
                action: action.clone(),
                error: err.to_string(),
            });
        }
        result
    }

    pub async fn click(&self, target: &TargetRef) -> Result<(), ActionError> {
        let resolution = self.resolver.resolve(target).await?;
        let at = self
            .driver
            .box_center(&resolution.selector)
            .await?
            .ok_or_else(|| ActionError::NoLayout(target.clone()))?;
        self.click_at(at).await
    }

    pub async fn set_value(&self, target: &TargetRef, value: &str) -> Result<(), ActionError> {
        self.fill(target, value, false).await
    }

    pub async fn set_value_and_enter(&self, target: &TargetRef, value: &str) -> Result<(), ActionError> {
        self.fill(target, value, true).await
    }

    pub async fn navigate(&self, url: &str) -> Result<(), ActionError> {
        self.driver.navigate(url).await?;
        self.channel.invalidate().await;
        Ok(())
    }

    pub async fn scroll(&self, direction: ScrollDirection) -> Result<(), ActionError> {
        self.driver.evaluate(scroll_expression(direction)).await?;
        sleep(self.cfg.after_scroll).await;
        Ok(())
    }

    pub async fn wait(&self) -> Result<(), ActionError> {
        sleep(self.cfg.wait).await;
        Ok(())
    }

    /// Poll the document's HTML length until two consecutive readings agree.
    /// Returns `false` when the timeout passes first.
    pub async fn wait_for_stable_html(&self) -> Result<bool, ActionError> {
        let deadline = Instant::now() + self.cfg.stable_timeout;
        let mut previous = None;
        loop {
            let length = self.driver.evaluate(HTML_LENGTH).await?.as_u64().unwrap_or(0);
            if previous == Some(length) {
                return Ok(true);
            }
            previous = Some(length);
            if Instant::now() >= deadline {
                debug!(length, "page still changing at timeout");
                return Ok(false);
            }
            sleep(self.cfg.stable_interval).await;
        }
    }

    async fn fill(&self, target: &TargetRef, value: &str, submit: bool) -> Result<(), ActionError> {
        match self.resolver.locate(target).await {
            Ok((_, at)) => {
                self.click_at(at).await?;
                self.select_all().await?;
                self.type_text(value).await?;
                if submit {
                    self.press_enter(SHIFT).await?;
                }
                return Ok(());
            }
            Err(ResolutionError::NotFound(_)) => {}
        }

        info!(%target, "falling back to in-page input scan");
        let hit = self
            .driver
            .evaluate(&broad_scan_expression(target.as_str(), value))
            .await?
            .as_bool()
            .unwrap_or(false);
        if !hit {
            return Err(ResolutionError::NotFound(target.clone()).into());
        }
        if submit {
            self.press_enter(SHIFT).await?;
        }
        Ok(())
    }

    async fn click_at(&self, at: Point) -> Result<(), ActionError> {
        if let Err(err) = self.channel.call("ripple", vec![json!(at.x), json!(at.y)]).await {
            debug!(error = %err, "ripple feedback unavailable");
        }
        let event = |kind| MouseEvent { kind, at, click_count: 1 };
        self.driver.dispatch_mouse(event(MouseEventKind::Pressed)).await?;
        sleep(self.cfg.press_release_gap).await;
        self.driver.dispatch_mouse(event(MouseEventKind::Released)).await?;
        sleep(self.cfg.after_click).await;
        Ok(())
    }

    async fn select_all(&self) -> Result<(), ActionError> {
        self.driver.dispatch_key(KeyEvent::select_all()).await?;
        sleep(self.cfg.after_select_all).await;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), ActionError> {
        let half = self.cfg.keystroke / 2;
        for c in text.chars() {
            if c == '\n' {
                self.press_enter(0).await?;
                continue;
            }
            self.driver.dispatch_key(KeyEvent::down(c)).await?;
            sleep(half).await;
            self.driver.dispatch_key(KeyEvent::up(c)).await?;
            sleep(half).await;
        }
        Ok(())
    }

    async fn press_enter(&self, modifiers: i64) -> Result<(), ActionError> {
        for event in KeyEvent::carriage_return(modifiers) {
            self.driver.dispatch_key(event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::KeyEventKind;
    use crate::transport::tests::{fast_config, FakeContext};
    use crate::transport::Transport;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Exists(String),
        Mouse(MouseEventKind, Point),
        Key(KeyEvent),
        Eval(String),
        Navigate(String),
    }

    #[derive(Default)]
    struct Recorder {
        live: Vec<String>,
        layout: bool,
        scan_hits: bool,
        html_lengths: Mutex<Vec<u64>>,
        calls: Mutex<Vec<Call>>,
    }

    #[async_trait]
    impl PageDriver for Recorder {
        async fn exists(&self, selector: &str) -> Result<bool, ActionError> {
            self.calls.lock().push(Call::Exists(selector.into()));
            Ok(self.live.iter().any(|s| s == selector))
        }
        async fn box_center(&self, _selector: &str) -> Result<Option<Point>, ActionError> {
            Ok(self.layout.then_some(Point { x: 50.0, y: 20.0 }))
        }
        async fn dispatch_mouse(&self, event: MouseEvent) -> Result<(), ActionError> {
            self.calls.lock().push(Call::Mouse(event.kind, event.at));
            Ok(())
        }
        async fn dispatch_key(&self, event: KeyEvent) -> Result<(), ActionError> {
            self.calls.lock().push(Call::Key(event));
            Ok(())
        }
        async fn evaluate(&self, expression: &str) -> Result<Value, ActionError> {
            self.calls.lock().push(Call::Eval(expression.into()));
            if expression == HTML_LENGTH {
                let mut lengths = self.html_lengths.lock();
                let next = if lengths.len() > 1 { lengths.remove(0) } else { lengths[0] };
                return Ok(json!(next));
            }
            Ok(json!(self.scan_hits))
        }
        async fn navigate(&self, url: &str) -> Result<(), ActionError> {
            self.calls.lock().push(Call::Navigate(url.into()));
            Ok(())
        }
    }

    fn executor(driver: Arc<Recorder>) -> (ActionExecutor, Arc<FakeContext>) {
        let ctx = Arc::new(FakeContext::default());
        let channel = PageChannel::new(Arc::new(Transport::new(fast_config())), ctx.clone());
        (ActionExecutor::new(driver, channel, ExecutorConfig::immediate()), ctx)
    }

    fn keys(calls: &[Call]) -> Vec<KeyEvent> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::Key(k) => Some(k.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn click_ripples_then_presses_at_center() {
        let driver = Arc::new(Recorder {
            live: vec![r#"[data-pilot-idx="3"]"#.into()],
            layout: true,
            ..Default::default()
        });
        let (exec, ctx) = executor(driver.clone());
        exec.execute(&Action::Click { target_id: "3".into() }).await.unwrap();

        let methods: Vec<String> = ctx.dispatched.lock().iter().map(|m| m.method.clone()).collect();
        assert_eq!(methods, vec!["getUniqueSelector", "ripple"]);
        let at = Point { x: 50.0, y: 20.0 };
        let mouse: Vec<Call> = driver
            .calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Mouse(..)))
            .cloned()
            .collect();
        assert_eq!(mouse, vec![Call::Mouse(MouseEventKind::Pressed, at), Call::Mouse(MouseEventKind::Released, at)]);
    }

    #[tokio::test]
    async fn set_value_and_enter_types_per_character_then_shift_return() {
        let driver = Arc::new(Recorder {
            live: vec![r#"[id="7"]"#.into()],
            layout: true,
            ..Default::default()
        });
        let (exec, _) = executor(driver.clone());
        exec.set_value_and_enter(&"7".into(), "a\nb").await.unwrap();

        let keys = keys(&driver.calls.lock());
        assert_eq!(keys[0], KeyEvent::select_all());
        assert_eq!(keys[1], KeyEvent::down('a'));
        assert_eq!(keys[2], KeyEvent::up('a'));
        assert_eq!(keys[3..6], KeyEvent::carriage_return(0));
        assert_eq!(keys[6], KeyEvent::down('b'));
        assert_eq!(keys[7], KeyEvent::up('b'));
        assert_eq!(keys[8..11], KeyEvent::carriage_return(SHIFT));
        assert_eq!(keys.len(), 11);
    }

    #[tokio::test]
    async fn unresolvable_input_uses_broad_scan() {
        let driver = Arc::new(Recorder {
            scan_hits: true,
            ..Default::default()
        });
        let (exec, _) = executor(driver.clone());
        exec.set_value(&"q".into(), "fox").await.unwrap();
        let calls = driver.calls.lock();
        let Some(Call::Eval(script)) = calls.last() else {
            panic!("expected a scan, got {calls:?}");
        };
        assert!(script.contains("querySelectorAll('input, textarea')"));
        assert!(keys(&calls).is_empty());
    }

    #[tokio::test]
    async fn broad_scan_miss_is_a_resolution_error() {
        let (exec, _) = executor(Arc::new(Recorder::default()));
        let err = exec.set_value(&"q".into(), "fox").await.unwrap_err();
        assert_eq!(err, ActionError::Resolution(ResolutionError::NotFound("q".into())));
    }

    #[tokio::test]
    async fn click_without_layout_fails() {
        let driver = Arc::new(Recorder {
            live: vec![r#"[id="5"]"#.into()],
            ..Default::default()
        });
        let (exec, _) = executor(driver);
        let mut rx = exec.events.subscribe();
        let err = exec.execute(&Action::Click { target_id: "5".into() }).await.unwrap_err();
        assert_eq!(err, ActionError::NoLayout("5".into()));
        assert!(matches!(rx.recv().await.unwrap(), PilotEvent::ActionStarted { .. }));
        assert!(matches!(rx.recv().await.unwrap(), PilotEvent::ActionFailed { .. }));
    }

    #[tokio::test]
    async fn navigate_invalidates_the_context() {
        let driver = Arc::new(Recorder::default());
        let (exec, ctx) = executor(driver.clone());
        exec.channel.call("snapshot", vec![]).await.unwrap();
        let pings = ctx.pings.load(std::sync::atomic::Ordering::SeqCst);

        exec.navigate("https://example.com").await.unwrap();
        exec.channel.call("snapshot", vec![]).await.unwrap();
        assert_eq!(ctx.pings.load(std::sync::atomic::Ordering::SeqCst), pings + 1);
        assert!(driver.calls.lock().contains(&Call::Navigate("https://example.com".into())));
    }

    #[tokio::test]
    async fn scroll_evaluates_direction_script() {
        let driver = Arc::new(Recorder::default());
        let (exec, _) = executor(driver.clone());
        exec.execute(&Action::Scroll { direction: ScrollDirection::Top }).await.unwrap();
        assert_eq!(
            *driver.calls.lock(),
            vec![Call::Eval(scroll_expression(ScrollDirection::Top).to_string())]
        );
    }

    #[tokio::test]
    async fn stable_html_needs_two_equal_readings() {
        let driver = Arc::new(Recorder {
            html_lengths: Mutex::new(vec![10, 20, 20]),
            ..Default::default()
        });
        let (exec, _) = executor(driver.clone());
        let exec = ActionExecutor {
            cfg: ExecutorConfig {
                stable_timeout: Duration::from_secs(5),
                ..ExecutorConfig::immediate()
            },
            ..exec
        };
        assert!(exec.wait_for_stable_html().await.unwrap());
        let reads = driver.calls.lock().iter().filter(|c| matches!(c, Call::Eval(_))).count();
        assert_eq!(reads, 3);
    }

    #[test]
    fn keystroke_kinds_alternate() {
        assert_eq!(KeyEvent::down('x').kind, KeyEventKind::KeyDown);
        assert_eq!(KeyEvent::up('x').kind, KeyEventKind::KeyUp);
    }
}
