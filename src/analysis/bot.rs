use super::quartiles::{quartiles, QuartileError};
use crate::buffer::{AnalysisState, HistoryStore};
use crate::config::types::BotDetectionConfig;
use crate::notify::{IpReport, Notification, NotificationKind, Notifier};
use crate::record::{InputRecord, ServiceInput};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info};

/// Intervals needed in the sample before traffic is compared
pub const MIN_PREV_NUM_REQUESTS_SAMPLE_SIZE: usize = 10;
const BUFFER_CLEANUP_PROBABILITY: f64 = 0.1;
const BUFFER_CLEANUP_MAX_AGE_HOURS: i64 = 6;
const SUSPICIOUS_RECORDS_THRESHOLD: f64 = 0.9;
const SUSPICIOUS_RECORDS_MIN_REQUESTS: usize = 20;

#[derive(Debug, Default)]
struct IpCounter {
    count: usize,
    suspicious: usize,
}

/// Looks for traffic surges and outlier IP addresses in the records
/// collected since the previous check.
#[derive(Debug)]
pub struct BotAnalyzer {
    app_type: String,
    conf: BotDetectionConfig,
    interval: Duration,
    notifier: Notifier,
}

fn is_ignored_ip(ip: &IpAddr) -> bool {
    ip.is_loopback() || ip.is_unspecified()
}

impl BotAnalyzer {
    pub fn new(
        app_type: &str,
        conf: BotDetectionConfig,
        analysis_interval_secs: u64,
        notifier: Notifier,
    ) -> Self {
        Self {
            app_type: app_type.to_string(),
            conf,
            interval: Duration::seconds(analysis_interval_secs as i64),
            notifier,
        }
    }

    /// Never changes the record stream, only reports
    pub fn preprocess(&self, rec: InputRecord, history: &mut dyn HistoryStore) -> Vec<InputRecord> {
        if !rec.should_be_analyzed() {
            return vec![rec];
        }
        let now = rec.time();
        let mut state = history.take_state();
        match state.last_check {
            None => state.last_check = Some(now),
            Some(last_check) if now - last_check < self.interval => {}
            Some(last_check) => {
                self.check(&mut state, last_check, now, history);
                state.last_check = Some(now);
            }
        }
        history.set_state(state);
        vec![rec]
    }

    fn check(
        &self,
        state: &mut AnalysisState,
        last_check: DateTime<Utc>,
        now: DateTime<Utc>,
        history: &mut dyn HistoryStore,
    ) {
        let current = history.total_num_of_records_since(last_check);
        let prev_mean = if state.prev_nums.len() >= MIN_PREV_NUM_REQUESTS_SAMPLE_SIZE {
            state.prev_nums.mean()
        } else {
            None
        };
        let sample_size = state.prev_nums.add(current as u64);
        let Some(mean) = prev_mean else {
            debug!(
                app_type = %self.app_type,
                current,
                sample_size,
                "Previous requests sample not ready yet"
            );
            return;
        };

        let ratio = if mean > 0.0 { current as f64 / mean } else { 0.0 };
        debug!(
            app_type = %self.app_type,
            mean,
            current,
            ratio,
            "Checking for suspicious activity"
        );
        let surge = ratio >= self.conf.traffic_reporting_threshold;
        if surge {
            info!(
                app_type = %self.app_type,
                mean,
                current,
                ratio,
                "Found suspicious increase in traffic, going to report"
            );
            self.notifier.notify(
                Notification::new(
                    &self.app_type,
                    format!("logfeed for {}: suspicious increase in traffic", self.app_type),
                    NotificationKind::TrafficSurge {
                        ratio,
                        current,
                        mean,
                    },
                )
                .line(format!(
                    "previous (sampled): {}, current: {} (increase {:.2})",
                    mean as u64, current, ratio
                ))
                .line(format!("checking interval: {}s", self.interval.num_seconds()))
                .line(format!("last check: {}", last_check.to_rfc3339())),
            );
        }

        let counters = self.count_ips(last_check, history);
        self.report_suspicious(&counters, last_check);
        self.report_outliers(&counters, last_check, surge.then_some(ratio));

        if rand::rng().random::<f64>() < BUFFER_CLEANUP_PROBABILITY {
            let cutoff = now - Duration::hours(BUFFER_CLEANUP_MAX_AGE_HOURS);
            let removed = history.clear_old_records(cutoff);
            info!(app_type = %self.app_type, removed, "Performed buffer records cleanup");
        }
    }

    fn count_ips(
        &self,
        since: DateTime<Utc>,
        history: &dyn HistoryStore,
    ) -> HashMap<IpAddr, IpCounter> {
        let mut counters: HashMap<IpAddr, IpCounter> = HashMap::new();
        history.total_for_each(&mut |item| {
            if item.time() <= since {
                return;
            }
            let Some(ip) = item.client_ip() else {
                return;
            };
            if is_ignored_ip(&ip) {
                return;
            }
            let counter = counters.entry(ip).or_default();
            counter.count += 1;
            if item.is_suspicious() {
                counter.suspicious += 1;
            }
        });
        counters
    }

    fn report_suspicious(&self, counters: &HashMap<IpAddr, IpCounter>, last_check: DateTime<Utc>) {
        let mut ips: Vec<IpReport> = counters
            .iter()
            .filter(|(_, c)| {
                c.suspicious >= SUSPICIOUS_RECORDS_MIN_REQUESTS
                    && c.suspicious as f64 / c.count as f64 >= SUSPICIOUS_RECORDS_THRESHOLD
            })
            .map(|(ip, c)| self.ip_report(ip, c.count))
            .collect();
        if ips.is_empty() {
            return;
        }
        ips.sort_by(|a, b| b.count.cmp(&a.count));
        info!(app_type = %self.app_type, num_ips = ips.len(), "Found consistently suspicious IPs");
        let listing = ips.iter().map(|r| r.ip.as_str()).collect::<Vec<_>>().join(", ");
        self.notifier.notify(
            Notification::new(
                &self.app_type,
                format!("logfeed for {}: suspicious IP addresses detected", self.app_type),
                NotificationKind::SuspiciousIps { ips },
            )
            .line(format!("records with high ratio of suspicious requests: {}", listing))
            .line(format!("total requesting IPs: {}", counters.len()))
            .line(format!("last check: {}", last_check.to_rfc3339())),
        );
    }

    fn report_outliers(
        &self,
        counters: &HashMap<IpAddr, IpCounter>,
        last_check: DateTime<Utc>,
        surge_ratio: Option<f64>,
    ) {
        let mut counts: Vec<usize> = counters.values().map(|c| c.count).collect();
        counts.sort_unstable();
        let q = match quartiles(&counts) {
            Ok(q) => q,
            Err(QuartileError::TooSmallDataset(n)) => {
                debug!(app_type = %self.app_type, num_ips = n, "Too few IPs for outlier search");
                return;
            }
        };
        let threshold = self
            .conf
            .ip_outlier_min_freq
            .max((q.q3 + self.conf.ip_outlier_coeff * q.iqr()) as usize);
        let mut outliers: Vec<IpReport> = counters
            .iter()
            .filter(|(_, c)| c.count > threshold)
            .map(|(ip, c)| self.ip_report(ip, c.count))
            .collect();
        if outliers.is_empty() {
            return;
        }
        outliers.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.ip.cmp(&b.ip)));
        info!(
            app_type = %self.app_type,
            threshold,
            num_outliers = outliers.len(),
            "Found outlier IP requests, going to report"
        );

        let mut notification = Notification::new(
            &self.app_type,
            format!("logfeed for {}: outlier IP addresses detected", self.app_type),
            NotificationKind::IpOutliers {
                threshold,
                outliers: outliers.clone(),
            },
        );
        if let Some(ratio) = surge_ratio {
            notification = notification.line(format!(
                "This report is supported with suspicious increase of traffic ({:.2}).",
                ratio
            ));
        }
        for o in &outliers {
            notification = notification.line(format!("{}: {} requests, known: {}", o.ip, o.count, o.known));
        }
        self.notifier.notify(
            notification
                .line(format!("total requesting IPs: {}", counters.len()))
                .line(format!("threshold: {} requests", threshold))
                .line(format!("last check: {}", last_check.to_rfc3339())),
        );
    }

    fn ip_report(&self, ip: &IpAddr, count: usize) -> IpReport {
        let ip = ip.to_string();
        let known = self.conf.blocklist_ip.contains(&ip);
        IpReport { ip, count, known }
    }
}
