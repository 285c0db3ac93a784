use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_ATTEMPTS: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static VARDIFF_RETARGETS: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();
static SOURCE_BANS: OnceLock<IntCounter> = OnceLock::new();

static NODE_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static NODE_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static BLOCKS_CONFIRMED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_ORPHANED: OnceLock<IntCounter> = OnceLock::new();
static PAYMENTS: OnceLock<IntCounterVec> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGaugeVec> = OnceLock::new();
static JOB_HEIGHT: OnceLock<IntGauge> = OnceLock::new();
static NETWORK_DIFFICULTY: OnceLock<IntGauge> = OnceLock::new();
static UNKNOWN_PAYMENTS: OnceLock<IntGauge> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// Names and help strings below are static; construction only fails on an
// invalid metric name and registration only on a duplicate one.
fn registered<C: Collector + Clone + 'static>(metric: C) -> C {
    registry()
        .register(Box::new(metric.clone()))
        .expect("static metric definition");
    metric
}

fn counter(name: &str, help: &str) -> IntCounter {
    registered(IntCounter::new(name, help).expect("static metric definition"))
}

fn gauge(name: &str, help: &str) -> IntGauge {
    registered(IntGauge::new(name, help).expect("static metric definition"))
}

fn counter_vec(name: &str, help: &str, label: &str) -> IntCounterVec {
    registered(IntCounterVec::new(Opts::new(name, help), &[label]).expect("static metric definition"))
}

fn gauge_vec(name: &str, help: &str, label: &str) -> IntGaugeVec {
    registered(IntGaugeVec::new(Opts::new(name, help), &[label]).expect("static metric definition"))
}

fn accepted() -> &'static IntCounter {
    ACCEPTED.get_or_init(|| counter("shares_accepted_total", "Total accepted shares"))
}

fn rejected() -> &'static IntCounterVec {
    REJECTED.get_or_init(|| counter_vec("shares_rejected_total", "Total rejected shares by reason", "reason"))
}

fn blocks_found() -> &'static IntCounter {
    BLOCKS_FOUND.get_or_init(|| counter("blocks_found_total", "Total blocks accepted by the node"))
}

fn block_submit_attempts() -> &'static IntCounter {
    BLOCK_SUBMIT_ATTEMPTS.get_or_init(|| {
        counter(
            "block_submit_attempts_total",
            "Total block submit attempts (block candidates)",
        )
    })
}

fn block_submit_rejected() -> &'static IntCounter {
    BLOCK_SUBMIT_REJECTED.get_or_init(|| {
        counter("block_submit_rejected_total", "Total block submits rejected by the node")
    })
}

fn vardiff_retargets() -> &'static IntCounter {
    VARDIFF_RETARGETS.get_or_init(|| counter("vardiff_retargets_total", "Total VarDiff retarget events"))
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| counter("job_broadcasts_total", "Total mining.notify messages sent"))
}

fn source_bans() -> &'static IntCounter {
    SOURCE_BANS.get_or_init(|| {
        counter("source_bans_total", "Connections dropped for too many invalid shares")
    })
}

fn node_requests() -> &'static IntCounter {
    NODE_REQUESTS.get_or_init(|| counter("node_requests_total", "Total requests to the Ergo node"))
}

fn node_errors() -> &'static IntCounter {
    NODE_ERRORS.get_or_init(|| counter("node_errors_total", "Total failed requests to the Ergo node"))
}

fn blocks_confirmed() -> &'static IntCounter {
    BLOCKS_CONFIRMED.get_or_init(|| counter("blocks_confirmed_total", "Blocks confirmed and credited"))
}

fn blocks_orphaned() -> &'static IntCounter {
    BLOCKS_ORPHANED.get_or_init(|| counter("blocks_orphaned_total", "Blocks marked orphan"))
}

fn payments() -> &'static IntCounterVec {
    PAYMENTS.get_or_init(|| counter_vec("payments_total", "Payments by final status", "status"))
}

fn active_connections() -> &'static IntGaugeVec {
    ACTIVE_CONNECTIONS.get_or_init(|| {
        gauge_vec("stratum_active_connections", "Active Stratum connections", "mode")
    })
}

fn job_height() -> &'static IntGauge {
    JOB_HEIGHT.get_or_init(|| gauge("job_height", "Height of the current mining job"))
}

fn network_difficulty() -> &'static IntGauge {
    NETWORK_DIFFICULTY.get_or_init(|| gauge("network_difficulty", "Network difficulty reported by the node"))
}

fn unknown_payments() -> &'static IntGauge {
    UNKNOWN_PAYMENTS.get_or_init(|| {
        gauge("payments_unknown", "Payments in UNKNOWN state (payouts halted while > 0)")
    })
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected(reason: &str) {
    rejected().with_label_values(&[reason]).inc();
}

pub fn inc_blocks_found() {
    blocks_found().inc();
}

pub fn inc_block_submit_attempts() {
    block_submit_attempts().inc();
}

pub fn inc_block_submit_rejected() {
    block_submit_rejected().inc();
}

pub fn inc_vardiff_retargets() {
    vardiff_retargets().inc();
}

pub fn inc_job_broadcasts(n: u64) {
    job_broadcasts().inc_by(n);
}

pub fn inc_source_bans() {
    source_bans().inc();
}

pub fn inc_node_requests() {
    node_requests().inc();
}

pub fn inc_node_errors() {
    node_errors().inc();
}

pub fn inc_blocks_confirmed() {
    blocks_confirmed().inc();
}

pub fn inc_blocks_orphaned() {
    blocks_orphaned().inc();
}

pub fn inc_payments(status: &str, n: u64) {
    payments().with_label_values(&[status]).inc_by(n);
}

pub fn inc_connections(mode: &str) {
    active_connections().with_label_values(&[mode]).inc();
}

pub fn dec_connections(mode: &str) {
    active_connections().with_label_values(&[mode]).dec();
}

pub fn set_job_height(h: u64) {
    job_height().set(h as i64);
}

pub fn set_network_difficulty(d: u64) {
    network_difficulty().set(d.min(i64::MAX as u64) as i64);
}

pub fn set_unknown_payments(n: usize) {
    unknown_payments().set(n as i64);
}

// Forces every metric into the registry so families show up before first use.
fn init() {
    accepted();
    rejected();
    blocks_found();
    block_submit_attempts();
    block_submit_rejected();
    vardiff_retargets();
    job_broadcasts();
    source_bans();
    node_requests();
    node_errors();
    blocks_confirmed();
    blocks_orphaned();
    payments();
    active_connections();
    job_height();
    network_difficulty();
    unknown_payments();
}

pub fn render() -> String {
    init();
    let enc = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = enc.encode(&registry().gather(), &mut buf) {
        tracing::warn!(error = %e, "Metrics encoding failed");
    }
    String::from_utf8_lossy(&buf).to_string()
}
