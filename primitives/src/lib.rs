//! Vault Shared Primitives
//!
//! Common types, constants and cross-pallet interfaces used by the vault
//! ledger and the strategy allocator.

#![cfg_attr(not(feature = "std"), no_std)]

use sp_runtime::{DispatchError, DispatchResult};

pub mod math;

pub use math::{bps_of, mul_div, safe_sub, to_bps};

// ============================================================================
// Common Types
// ============================================================================

/// Basis points, 1 bp = 0.01%
pub type BasisPoints = u32;

/// Share units issued by the ledger
pub type Shares = u128;

/// Rounding direction for share/asset conversions.
///
/// Every conversion names its direction explicitly; the ledger always picks
/// the one that leaves the fractional unit with the pool.
pub use sp_runtime::Rounding;

// ============================================================================
// Constants
// ============================================================================

/// 100% expressed in basis points
pub const MAX_BPS: BasisPoints = 10_000;

/// Hard cap on the withdrawal fee (1%)
pub const MAX_WITHDRAWAL_FEE_BPS: BasisPoints = 100;

/// Hard cap on the performance fee (20%)
pub const MAX_PERFORMANCE_FEE_BPS: BasisPoints = 2_000;

/// Allowance value that is never decremented when spent
pub const INFINITE_ALLOWANCE: Shares = Shares::MAX;

// ============================================================================
// Cross-pallet Interfaces
// ============================================================================

/// Surface the ledger uses to move capital in and out of strategies.
///
/// Implemented by the allocator. The implementation never touches share
/// accounting; it only moves assets between the custody account of the
/// ledger, its own staging account and the strategies. The ledger calls the
/// mutating methods while it holds the vault lock (see [`VaultCustody::guarded`]).
pub trait StrategyManager<AccountId, Balance> {
    /// Sum of `estimated_total_assets` over every active strategy. Fails
    /// rather than clamping when the sum does not fit.
    fn total_assets_in_strategies() -> Result<Balance, DispatchError>;

    /// Fan `amount` out of the ledger custody account into the active
    /// strategies by weight. Returns the amount actually deployed; any
    /// rounding remainder is left in the custody account.
    fn deposit_to_strategies(amount: Balance) -> Result<Balance, DispatchError>;

    /// Pull up to `amount` back from strategies in registry order and forward
    /// it to the ledger custody account. May return less than requested.
    fn withdraw_from_strategies(amount: Balance) -> Result<Balance, DispatchError>;

    /// Force-liquidate every active strategy, tolerating individual failures.
    /// Returns the amount recovered to the ledger custody account.
    fn emergency_withdraw_all() -> Result<Balance, DispatchError>;
}

/// Surface the allocator uses to hand capital back to the ledger.
///
/// Implemented by the ledger.
pub trait VaultCustody<AccountId, Balance> {
    /// Account that physically holds the idle balance.
    fn custody_account() -> AccountId;

    /// `amount` of principal has just been transferred into the custody
    /// account and must be credited to the idle balance.
    fn on_capital_returned(amount: Balance) -> DispatchResult;

    /// `profit` realized by a harvest has just been transferred into the
    /// custody account. Returns the performance fee charged on it.
    fn on_profit_realized(profit: Balance) -> Result<Balance, DispatchError>;

    /// Run `f` under the vault-wide re-entrancy lock. Mutating entry points of
    /// the ledger and of the allocator share this single lock, so code called
    /// out to from either side cannot re-enter the other.
    fn guarded<R, F>(f: F) -> Result<R, DispatchError>
    where
        F: FnOnce() -> Result<R, DispatchError>;
}
