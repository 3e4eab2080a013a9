//! Centralized constants for the gateway crate
//!
//! Defaults for timeouts, inventory thresholds, fees and intervals. Values
//! an operator may tune at runtime live in `config::Config`; these are the
//! fixed protocol parameters and loop cadences.

// =============================================================================
// Session and Challenge Lifetimes
// =============================================================================

/// Default lifetime of a signing session (30 minutes).
pub const SESSION_TIMEOUT_SECS: i64 = 30 * 60;

/// Default lifetime of a signing challenge (5 minutes).
pub const CHALLENGE_TIMEOUT_SECS: i64 = 5 * 60;

/// Soft ceiling on concurrent non-terminal sessions; past this, new
/// intents fail with a busy notice.
pub const MAX_CONCURRENT_SESSIONS: u64 = 100;

/// Grace window after a session's deadline in which confirmation publishes
/// keep retrying before being dropped for out-of-band reconciliation.
pub const PUBLISH_GRACE_SECS: u64 = 10 * 60;

// =============================================================================
// Fees
// =============================================================================

/// Fixed L2 transfer fee, charged as a dedicated output in the native
/// asset.
pub const TRANSFER_FEE_UNITS: i64 = 10;

/// Lightning land fee: 0.1% of the withdrawn amount (basis points).
pub const LAND_FEE_BPS: i64 = 10;

/// Fee limit handed to the Lightning daemon when paying a land invoice.
pub const LAND_PAYMENT_FEE_LIMIT_SATS: i64 = 1000;

// =============================================================================
// VTXO Inventory
// =============================================================================

/// Below this count of available VTXOs per asset a batch is requested
/// immediately.
pub const INVENTORY_CRITICAL_THRESHOLD: u64 = 1_000;

/// Below this count a batch is scheduled when fees are acceptable.
pub const INVENTORY_WARNING_THRESHOLD: u64 = 3_000;

/// Inventory level the monitor steers toward.
pub const INVENTORY_TARGET_LEVEL: u64 = 10_000;

/// VTXOs minted per replenishment batch.
pub const INVENTORY_BATCH_SIZE: u32 = 1_000;

/// Fee-rate ceiling (sat/vbyte) above which scheduled (non-critical)
/// batches wait for cheaper blocks.
pub const INVENTORY_FEE_CEILING_SAT_PER_VB: i64 = 50;

/// Default denomination of minted VTXOs.
pub const DEFAULT_VTXO_AMOUNT_SATS: i64 = 100_000;

/// Lifetime of a minted VTXO before the expiry sweeper reclaims it.
pub const VTXO_EXPIRY_HOURS: i64 = 24;

// =============================================================================
// Loop Intervals
// =============================================================================

/// Inventory monitor cadence (5 minutes).
pub const INVENTORY_MONITOR_INTERVAL_SECS: u64 = 5 * 60;

/// Session/challenge/invoice expiry sweeper cadence.
pub const SWEEPER_INTERVAL_SECS: u64 = 30;

/// L1 settlement coordinator cadence (hourly).
pub const SETTLEMENT_INTERVAL_SECS: u64 = 60 * 60;

/// Lightning invoice reconciliation cadence.
pub const RECONCILIATION_INTERVAL_SECS: u64 = 20;

/// Heartbeat log cadence.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 60;

// =============================================================================
// Ceremony
// =============================================================================

/// Cap on a single ceremony step beyond the session deadline.
pub const STEP_TIMEOUT_SECS: i64 = 5 * 60;

/// Transient daemon retries inside preparation steps before the ceremony
/// fails with backend_unavailable.
pub const STEP_MAX_TRANSIENT_RETRIES: u32 = 3;

// =============================================================================
// Settlement
// =============================================================================

/// Broadcast attempts per settlement run; the fee is bumped between
/// attempts.
pub const SETTLEMENT_BROADCAST_ATTEMPTS: u32 = 3;

/// Fee multiplier (percent) applied on each settlement broadcast retry.
pub const SETTLEMENT_FEE_BUMP_PERCENT: i64 = 25;

/// Max spent VTXOs folded into one commitment batch.
pub const SETTLEMENT_BATCH_LIMIT: u64 = 10_000;

// =============================================================================
// Shutdown
// =============================================================================

/// How long shutdown waits for in-flight ceremonies before cancelling them.
pub const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 60;

/// Progress log cadence while draining during shutdown.
pub const SHUTDOWN_PROGRESS_INTERVAL_SECS: u64 = 10;
