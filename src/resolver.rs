//! Turning a snapshot-local [`TargetRef`] into a selector for a live element.
//!
//! The id minted at snapshot time does not map to one stable DOM attribute on
//! every site, so strategies are tried in a fixed order and the first one
//! whose selector matches a live element wins.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::action::TargetRef;
use crate::driver::{PageDriver, Point};
use crate::error::{ResolutionError, TransportError};
use crate::transport::PageChannel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Selector previously assigned by the page snapshot.
    UniqueSelector,
    /// Index attribute written onto elements during the snapshot.
    DataAttribute,
    IdAttribute,
    InputNameOrId,
}

impl Strategy {
    pub const CHAIN: [Strategy; 4] = [
        Strategy::UniqueSelector,
        Strategy::DataAttribute,
        Strategy::IdAttribute,
        Strategy::InputNameOrId,
    ];
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::UniqueSelector => "unique_selector",
            Strategy::DataAttribute => "data_attribute",
            Strategy::IdAttribute => "id_attribute",
            Strategy::InputNameOrId => "input_name_or_id",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub strategy: Strategy,
    pub selector: String,
}

/// The page-snapshot collaborator's selector lookup.
#[async_trait]
pub trait SelectorSource: Send + Sync {
    async fn unique_selector(&self, target: &TargetRef) -> Result<Option<String>, TransportError>;
}

#[async_trait]
impl SelectorSource for PageChannel {
    async fn unique_selector(&self, target: &TargetRef) -> Result<Option<String>, TransportError> {
        let reply = self.call("getUniqueSelector", vec![json!(target.as_str())]).await?;
        Ok(match reply {
            Value::String(s) if !s.trim().is_empty() => Some(s),
            _ => None,
        })
    }
}

#[derive(Clone, Debug)]
pub struct ResolverConfig {
    pub index_attribute: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            index_attribute: "data-pilot-idx".to_string(),
        }
    }
}

pub struct Resolver {
    source: Arc<dyn SelectorSource>,
    driver: Arc<dyn PageDriver>,
    cfg: ResolverConfig,
}

impl Resolver {
    pub fn new(source: Arc<dyn SelectorSource>, driver: Arc<dyn PageDriver>, cfg: ResolverConfig) -> Self {
        Self { source, driver, cfg }
    }

    pub async fn resolve(&self, target: &TargetRef) -> Result<Resolution, ResolutionError> {
        for strategy in Strategy::CHAIN {
            let Some(selector) = self.candidate(strategy, target).await else {
                continue;
            };
            match self.driver.exists(&selector).await {
                Ok(true) => {
                    debug!(%target, %strategy, %selector, "target resolved");
                    return Ok(Resolution { strategy, selector });
                }
                Ok(false) => debug!(%target, %strategy, %selector, "selector matched nothing"),
                Err(err) => warn!(%target, %strategy, error = %err, "selector check failed"),
            }
        }
        Err(ResolutionError::NotFound(target.clone()))
    }

    /// Like [`Resolver::resolve`], but a live element without a layout box does
    /// not stop the chain; the next strategy is tried instead.
    pub async fn locate(&self, target: &TargetRef) -> Result<(Resolution, Point), ResolutionError> {
        for strategy in Strategy::CHAIN {
            let Some(selector) = self.candidate(strategy, target).await else {
                continue;
            };
            match self.driver.exists(&selector).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(%target, %strategy, %selector, "selector matched nothing");
                    continue;
                }
                Err(err) => {
                    warn!(%target, %strategy, error = %err, "selector check failed");
                    continue;
                }
            }
            match self.driver.box_center(&selector).await {
                Ok(Some(at)) => {
                    debug!(%target, %strategy, %selector, "target located");
                    return Ok((Resolution { strategy, selector }, at));
                }
                Ok(None) => debug!(%target, %strategy, %selector, "element has no layout"),
                Err(err) => warn!(%target, %strategy, error = %err, "box model lookup failed"),
            }
        }
        Err(ResolutionError::NotFound(target.clone()))
    }

    async fn candidate(&self, strategy: Strategy, target: &TargetRef) -> Option<String> {
        let quoted = css_string(target.as_str());
        match strategy {
            Strategy::UniqueSelector => match self.source.unique_selector(target).await {
                Ok(selector) => selector,
                Err(err) => {
                    warn!(%target, error = %err, "unique selector lookup failed");
                    None
                }
            },
            Strategy::DataAttribute => Some(format!("[{}={quoted}]", self.cfg.index_attribute)),
            Strategy::IdAttribute => Some(format!("[id={quoted}]")),
            Strategy::InputNameOrId => Some(format!("input[name={quoted}], input[id={quoted}]")),
        }
    }
}

/// Quote `value` as a CSS string literal.
pub fn css_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\a "),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}
