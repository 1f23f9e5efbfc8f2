//! Budget middleware
//!
//! Enforces hourly/daily/monthly spend caps through the budget store and
//! records per-request cost after the response. Alert thresholds crossed
//! on the way in are surfaced through request metadata.

use std::sync::Arc;

use chrono::{Datelike, SecondsFormat, TimeZone, Timelike, Utc};
use serde_json::json;

use crate::config::BudgetConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::context::RequestContext;
use crate::proxy::request::{ProxyRequest, ProxyResponse};
use crate::store::BudgetStore;

/// RFC3339 start of the current UTC hour.
pub fn hourly_period_start() -> String {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), 0, 0)
        .single()
        .unwrap_or(now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// RFC3339 UTC midnight of today.
pub fn daily_period_start() -> String {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// RFC3339 first-of-month 00:00:00 UTC.
pub fn monthly_period_start() -> String {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct BudgetMiddleware {
    config: BudgetConfig,
    store: Arc<dyn BudgetStore>,
}

impl BudgetMiddleware {
    pub fn new(config: BudgetConfig, store: Arc<dyn BudgetStore>) -> Self {
        BudgetMiddleware { config, store }
    }

    pub fn name(&self) -> &'static str {
        "budget"
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Configured periods with non-zero limits: (name, start, limit).
    fn periods(&self) -> Vec<(&'static str, String, f64)> {
        let mut periods = Vec::new();
        if self.config.hourly_usd > 0.0 {
            periods.push(("hourly", hourly_period_start(), self.config.hourly_usd));
        }
        if self.config.daily_usd > 0.0 {
            periods.push(("daily", daily_period_start(), self.config.daily_usd));
        }
        if self.config.monthly_usd > 0.0 {
            periods.push(("monthly", monthly_period_start(), self.config.monthly_usd));
        }
        periods
    }

    pub async fn process_request(
        &self,
        _ctx: &mut RequestContext,
        req: &mut ProxyRequest,
    ) -> ProxyResult<()> {
        for (period, start, limit) in self.periods() {
            let (spent, _) = match self.store.get_budget(period, &start) {
                Ok(budget) => budget,
                Err(e) => {
                    tracing::warn!(target: "tokenman::budget", "budget read failed: {e}");
                    continue;
                }
            };
            if spent >= limit {
                return Err(ProxyError::BudgetExceeded {
                    period: period.to_string(),
                    limit,
                    spent,
                });
            }
            let ratio = spent / limit;
            for threshold in &self.config.alert_thresholds {
                let t = *threshold;
                if t > 0.0 && t <= 1.0 && ratio >= t {
                    req.metadata.insert(
                        format!("budget_alert_{}", period),
                        json!({
                            "threshold": t,
                            "spent": spent,
                            "limit": limit,
                            "percent": ratio * 100.0,
                        }),
                    );
                }
            }
        }
        Ok(())
    }

    /// Record this request's cost in every configured period, tagged
    /// with the request's project. Persistence errors are swallowed;
    /// spend accounting is best-effort.
    pub async fn process_response(
        &self,
        ctx: &mut RequestContext,
        _req: &ProxyRequest,
        resp: &mut ProxyResponse,
    ) -> ProxyResult<()> {
        if resp.cost_usd <= 0.0 {
            return Ok(());
        }
        for (period, start, limit) in self.periods() {
            if let Err(e) = self
                .store
                .add_spending(period, &start, resp.cost_usd, limit, &ctx.project)
            {
                tracing::warn!(target: "tokenman::budget", "budget write failed: {e}");
            }
        }
        Ok(())
    }
}
