//! # Vault Allocator Pallet
//!
//! This pallet owns the registry of yield strategies the vault deploys capital
//! into, together with their target weights, and moves capital between the
//! vault custody account and those strategies.
//!
//! ## Overview
//!
//! - Strategies are registered by a strategist with a target weight in basis
//!   points. The sum of active weights never exceeds 10_000.
//! - The ledger pushes idle capital through `deposit_to_strategies` and pulls
//!   shortfalls back through `withdraw_from_strategies` (see
//!   [`vault_primitives::StrategyManager`]).
//! - Rebalance drains every strategy and refills it by weight.
//! - Harvest realizes rewards and hands the profit to the ledger.
//! - Emergency withdraw force-liquidates every strategy, isolating failures.
//!
//! ## Custody
//!
//! Capital returned by a strategy lands in this pallet's staging account and
//! is forwarded to the vault custody account within the same call. The staging
//! account holds nothing between calls.
//!
//! ## Key Invariants
//!
//! 1. **Weight Bound**: Σ `allocation_bps` over active strategies ≤ 10_000
//! 2. **Dense Registry**: `StrategyList[StrategyIndex[s]] == s` for every active `s`
//! 3. **No Orphaned Capital**: a strategy leaves the registry only once it holds nothing
//! 4. **Share Isolation**: this pallet never touches share accounting
//!
//! ## Re-entrancy
//!
//! Extrinsics run under the vault's lock ([`VaultCustody::guarded`]), the same
//! one the ledger takes, so a strategy hook cannot re-enter either pallet.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub use pallet::*;

/// Reference adapter that keeps capital in the strategy account
pub mod holding;
pub use holding::HoldingYieldSource;

#[cfg(test)]
mod mock;


use frame_support::traits::fungibles::{Inspect, Mutate};
use frame_support::traits::tokens::Preservation;
use frame_support::traits::Get;
use sp_runtime::traits::{AccountIdConversion, UniqueSaturatedInto, Zero};
use sp_runtime::{ArithmeticError, DispatchError, DispatchResult};
use vault_primitives::{BasisPoints, StrategyManager, VaultCustody, MAX_BPS};

const LOG_TARGET: &str = "vault-allocator";

// =============================================================================
//                              Traits
// =============================================================================

/// Capability every yield strategy must provide.
///
/// Strategies are addressed by their account id. Capital is transferred into
/// the strategy account before `deposit` is called; value-returning calls
/// transfer into `recipient`. `estimated_total_assets` is infallible; it feeds
/// the ledger's total-assets read.
pub trait YieldSource {
    type AccountId;
    type AssetId;
    type Balance;

    /// Asset this strategy accepts. Must match the vault asset.
    fn accepted_asset(strategy: &Self::AccountId) -> Self::AssetId;

    /// Sweep whatever the strategy account currently holds into the
    /// underlying placement.
    fn deposit(strategy: &Self::AccountId) -> DispatchResult;

    /// Liquidate up to `amount` into `recipient`. Returns the amount actually
    /// released, which may be less than requested.
    fn withdraw(
        strategy: &Self::AccountId,
        amount: Self::Balance,
        recipient: &Self::AccountId,
    ) -> Result<Self::Balance, DispatchError>;

    /// Liquidate everything into `recipient`.
    fn withdraw_all(
        strategy: &Self::AccountId,
        recipient: &Self::AccountId,
    ) -> Result<Self::Balance, DispatchError>;

    /// Claim and realize rewards into `recipient`. The effect is observed only
    /// through the recipient's balance delta.
    fn harvest(strategy: &Self::AccountId, recipient: &Self::AccountId) -> DispatchResult;

    /// Fast, side-effect-free estimate of the value held by the strategy.
    fn estimated_total_assets(strategy: &Self::AccountId) -> Self::Balance;

    /// Current yield in basis points.
    fn current_yield_rate(strategy: &Self::AccountId) -> BasisPoints;

    /// Best-effort full exit into `recipient`, may accept losses.
    fn emergency_withdraw(strategy: &Self::AccountId, recipient: &Self::AccountId) -> DispatchResult;

    /// Whether the strategy currently accepts capital.
    fn is_active(strategy: &Self::AccountId) -> bool;
}

#[frame_support::pallet]
pub mod pallet {
    use super::*;
    use alloc::vec::Vec;
    use frame_support::pallet_prelude::*;
    use frame_support::storage::with_storage_layer;
    use frame_support::PalletId;
    use frame_system::pallet_prelude::*;
    use sp_runtime::traits::Saturating;
    use vault_primitives::bps_of;

    // =========================================================================
    //                                  Types
    // =========================================================================

    /// Registry entry for a strategy
    #[derive(Encode, Decode, Clone, PartialEq, Eq, RuntimeDebug, TypeInfo, MaxEncodedLen)]
    #[scale_info(skip_type_params(T))]
    pub struct StrategyInfo<T: Config> {
        /// Target share of deployed capital, 0..=10_000
        pub allocation_bps: BasisPoints,
        /// Running principal counter. Best effort only, the yield source
        /// estimate is authoritative for accounting.
        pub total_deposited: T::Balance,
        /// Profit realized over the strategy's lifetime
        pub total_profit: T::Balance,
        /// Unix seconds of the last successful harvest
        pub last_harvest: u64,
        /// Inactive entries are kept for history only
        pub is_active: bool,
    }

    // =========================================================================
    //                                  Config
    // =========================================================================

    #[pallet::config]
    pub trait Config: frame_system::Config + pallet_timestamp::Config {
        type RuntimeEvent: From<Event<Self>> + IsType<<Self as frame_system::Config>::RuntimeEvent>;

        /// Balance type
        type Balance: Parameter
            + Member
            + From<u128>
            + Into<u128>
            + Copy
            + Default
            + MaxEncodedLen
            + Zero
            + Ord
            + Saturating;

        /// Asset ID type
        type AssetId: Parameter + Member + Copy + Default + MaxEncodedLen;

        /// Fungibles implementation for vault asset transfers
        type Assets: Mutate<Self::AccountId, AssetId = Self::AssetId, Balance = Self::Balance>
            + Inspect<Self::AccountId>;

        /// The single asset the vault accepts
        #[pallet::constant]
        type VaultAssetId: Get<Self::AssetId>;

        /// Strategy adapters
        type YieldSource: YieldSource<
            AccountId = Self::AccountId,
            AssetId = Self::AssetId,
            Balance = Self::Balance,
        >;

        /// The ledger that owns the capital and its idle balance
        type Vault: VaultCustody<Self::AccountId, Self::Balance>;

        /// Origin allowed to manage the registry, rebalance and harvest
        type StrategistOrigin: EnsureOrigin<Self::RuntimeOrigin>;

        /// Origin allowed to trigger an emergency withdrawal
        type GuardianOrigin: EnsureOrigin<Self::RuntimeOrigin>;

        /// Pallet ID for the staging account
        #[pallet::constant]
        type PalletId: Get<PalletId>;

        /// Maximum number of active strategies
        #[pallet::constant]
        type MaxStrategies: Get<u32>;
    }

    // =========================================================================
    //                                  Storage
    // =========================================================================

    #[pallet::pallet]
    pub struct Pallet<T>(_);

    /// Active strategies in registry order
    #[pallet::storage]
    #[pallet::getter(fn strategy_list)]
    pub type StrategyList<T: Config> =
        StorageValue<_, BoundedVec<T::AccountId, T::MaxStrategies>, ValueQuery>;

    /// Position of each active strategy in `StrategyList`
    #[pallet::storage]
    pub type StrategyIndex<T: Config> =
        StorageMap<_, Blake2_128Concat, T::AccountId, u32, OptionQuery>;

    /// Registry entries, including deactivated ones
    #[pallet::storage]
    #[pallet::getter(fn strategies)]
    pub type Strategies<T: Config> =
        StorageMap<_, Blake2_128Concat, T::AccountId, StrategyInfo<T>, OptionQuery>;

    /// Profit realized by all harvests
    #[pallet::storage]
    #[pallet::getter(fn total_realized_profit)]
    pub type TotalRealizedProfit<T: Config> = StorageValue<_, T::Balance, ValueQuery>;

    // =========================================================================
    //                                  Events
    // =========================================================================

    #[pallet::event]
    #[pallet::generate_deposit(pub(super) fn deposit_event)]
    pub enum Event<T: Config> {
        /// Strategy registered. [strategy, allocation_bps]
        StrategyAdded {
            strategy: T::AccountId,
            allocation_bps: BasisPoints,
        },
        /// Strategy drained and deactivated. [strategy, recovered]
        StrategyRemoved {
            strategy: T::AccountId,
            recovered: T::Balance,
        },
        /// Target weight changed. [strategy, old_bps, new_bps]
        AllocationUpdated {
            strategy: T::AccountId,
            old_bps: BasisPoints,
            new_bps: BasisPoints,
        },
        /// Vault capital fanned out. [requested, deployed]
        DeployedToStrategies {
            requested: T::Balance,
            deployed: T::Balance,
        },
        /// Capital pulled back to the vault. [requested, withdrawn]
        WithdrawnFromStrategies {
            requested: T::Balance,
            withdrawn: T::Balance,
        },
        /// A strategy withdrawal reverted and was skipped. [strategy, error]
        StrategyWithdrawFailed {
            strategy: T::AccountId,
            error: DispatchError,
        },
        /// Rewards realized. [strategy, profit, performance_fee]
        Harvested {
            strategy: T::AccountId,
            profit: T::Balance,
            performance_fee: T::Balance,
        },
        /// Harvest reverted during harvest_all. [strategy, error]
        HarvestFailed {
            strategy: T::AccountId,
            error: DispatchError,
        },
        /// Drain-and-refill completed. [recovered, redeployed, returned_to_vault]
        Rebalanced {
            recovered: T::Balance,
            redeployed: T::Balance,
            returned_to_vault: T::Balance,
        },
        /// Emergency exit completed. [recovered]
        EmergencyWithdrawn {
            recovered: T::Balance,
        },
        /// Emergency exit of one strategy reverted and was skipped. [strategy, error]
        EmergencyWithdrawFailed {
            strategy: T::AccountId,
            error: DispatchError,
        },
    }

    // =========================================================================
    //                                  Errors
    // =========================================================================

    #[pallet::error]
    pub enum Error<T> {
        /// Registry is full.
        TooManyStrategies,
        /// Strategy is already registered and active.
        StrategyAlreadyActive,
        /// Strategy is not registered or has been removed.
        StrategyNotActive,
        /// Strategy does not accept the vault asset.
        AssetMismatch,
        /// Yield source reports itself inactive.
        YieldSourceInactive,
        /// Allocation above 10_000 bps.
        InvalidAllocation,
        /// Allocation would push the active total above 10_000 bps.
        AllocationExceedsMax,
        /// Strategy still reports capital after a full withdrawal.
        StrategyStillHoldsCapital,
        /// Asset transfer failed.
        TransferFailed,
    }

    // =========================================================================
    //                                  Hooks
    // =========================================================================

    #[pallet::hooks]
    impl<T: Config> Hooks<BlockNumberFor<T>> for Pallet<T> {
        #[cfg(feature = "try-runtime")]
        fn try_state(_n: BlockNumberFor<T>) -> Result<(), sp_runtime::TryRuntimeError> {
            Self::do_try_state()
        }
    }

    // =========================================================================
    //                                Extrinsics
    // =========================================================================

    #[pallet::call]
    impl<T: Config> Pallet<T> {
        /// Register a strategy with a target weight.
        ///
        /// - `strategy`: Account id of the yield source
        /// - `allocation_bps`: Target weight, 10_000 = 100%
        #[pallet::call_index(0)]
        #[pallet::weight(Weight::from_parts(50_000, 0))]
        pub fn add_strategy(
            origin: OriginFor<T>,
            strategy: T::AccountId,
            allocation_bps: BasisPoints,
        ) -> DispatchResult {
            T::StrategistOrigin::ensure_origin(origin)?;

            T::Vault::guarded(|| Self::do_add_strategy(strategy, allocation_bps))
        }

        /// Drain a strategy back to the vault and remove it from the registry.
        #[pallet::call_index(1)]
        #[pallet::weight(Weight::from_parts(100_000, 0))]
        pub fn remove_strategy(origin: OriginFor<T>, strategy: T::AccountId) -> DispatchResult {
            T::StrategistOrigin::ensure_origin(origin)?;

            T::Vault::guarded(|| Self::do_remove_strategy(strategy))
        }

        /// Change the target weight of an active strategy.
        #[pallet::call_index(2)]
        #[pallet::weight(Weight::from_parts(30_000, 0))]
        pub fn update_allocation(
            origin: OriginFor<T>,
            strategy: T::AccountId,
            new_bps: BasisPoints,
        ) -> DispatchResult {
            T::StrategistOrigin::ensure_origin(origin)?;

            T::Vault::guarded(|| Self::do_update_allocation(strategy, new_bps))
        }

        /// Withdraw everything from every strategy, then redistribute by weight.
        #[pallet::call_index(3)]
        #[pallet::weight(Weight::from_parts(500_000, 0))]
        pub fn rebalance(origin: OriginFor<T>) -> DispatchResult {
            T::StrategistOrigin::ensure_origin(origin)?;

            T::Vault::guarded(|| Self::do_rebalance())
        }

        /// Harvest a single strategy. Failures propagate.
        #[pallet::call_index(4)]
        #[pallet::weight(Weight::from_parts(100_000, 0))]
        pub fn harvest(origin: OriginFor<T>, strategy: T::AccountId) -> DispatchResult {
            T::StrategistOrigin::ensure_origin(origin)?;

            T::Vault::guarded(|| Self::do_harvest(&strategy).map(|_| ()))
        }

        /// Harvest every active strategy, skipping those that revert.
        #[pallet::call_index(5)]
        #[pallet::weight(Weight::from_parts(500_000, 0))]
        pub fn harvest_all(origin: OriginFor<T>) -> DispatchResult {
            T::StrategistOrigin::ensure_origin(origin)?;

            T::Vault::guarded(|| Self::do_harvest_all().map(|_| ()))
        }

        /// Force-liquidate every strategy back to the vault.
        #[pallet::call_index(6)]
        #[pallet::weight(Weight::from_parts(500_000, 0))]
        pub fn emergency_withdraw_all(origin: OriginFor<T>) -> DispatchResult {
            T::GuardianOrigin::ensure_origin(origin)?;

            T::Vault::guarded(|| Self::do_emergency_withdraw_all().map(|_| ()))
        }
    }

    // =========================================================================
    //                           Internal Functions
    // =========================================================================

    impl<T: Config> Pallet<T> {
        /// Staging account that receives capital leaving strategies
        pub fn account_id() -> T::AccountId {
            T::PalletId::get().into_account_truncating()
        }

        fn staged_balance() -> T::Balance {
            T::Assets::balance(T::VaultAssetId::get(), &Self::account_id())
        }

        fn current_timestamp() -> u64 {
            let now_ms: u64 = pallet_timestamp::Pallet::<T>::now().unique_saturated_into();
            now_ms / 1000
        }

        /// Sum of active target weights
        pub fn total_allocation_bps() -> BasisPoints {
            StrategyList::<T>::get()
                .iter()
                .filter_map(|strategy| Strategies::<T>::get(strategy))
                .map(|info| info.allocation_bps)
                .sum()
        }

        /// Sum of strategy estimates over the active registry
        pub fn total_assets_in_strategies() -> Result<T::Balance, DispatchError> {
            let mut total: u128 = 0;
            for strategy in StrategyList::<T>::get() {
                let estimate: u128 = T::YieldSource::estimated_total_assets(&strategy).into();
                total = total.checked_add(estimate).ok_or(ArithmeticError::Overflow)?;
            }
            Ok(total.into())
        }

        /// Active strategies in registry order
        pub fn active_strategies() -> Vec<T::AccountId> {
            StrategyList::<T>::get().into_inner()
        }

        /// Full dump of the registry, including deactivated entries
        pub fn registry_snapshot() -> Vec<(T::AccountId, StrategyInfo<T>)> {
            Strategies::<T>::iter().collect()
        }

        /// Current yield reported by each active strategy
        pub fn strategy_yield_rates() -> Vec<(T::AccountId, BasisPoints)> {
            StrategyList::<T>::get()
                .into_iter()
                .map(|strategy| {
                    let rate = T::YieldSource::current_yield_rate(&strategy);
                    (strategy, rate)
                })
                .collect()
        }

        /// Capital-weighted yield across active strategies
        pub fn weighted_yield_rate() -> Result<BasisPoints, DispatchError> {
            let mut weighted: u128 = 0;
            let mut deployed: u128 = 0;
            for strategy in StrategyList::<T>::get() {
                let assets: u128 = T::YieldSource::estimated_total_assets(&strategy).into();
                let rate = T::YieldSource::current_yield_rate(&strategy) as u128;
                weighted = assets
                    .checked_mul(rate)
                    .and_then(|w| weighted.checked_add(w))
                    .ok_or(ArithmeticError::Overflow)?;
                deployed = deployed.checked_add(assets).ok_or(ArithmeticError::Overflow)?;
            }
            if deployed == 0 {
                return Ok(0);
            }
            BasisPoints::try_from(weighted / deployed).map_err(|_| ArithmeticError::Overflow.into())
        }

        pub fn do_add_strategy(strategy: T::AccountId, allocation_bps: BasisPoints) -> DispatchResult {
            let mut list = StrategyList::<T>::get();
            ensure!(
                (list.len() as u32) < T::MaxStrategies::get(),
                Error::<T>::TooManyStrategies
            );
            ensure!(
                !StrategyIndex::<T>::contains_key(&strategy),
                Error::<T>::StrategyAlreadyActive
            );
            ensure!(
                T::YieldSource::accepted_asset(&strategy) == T::VaultAssetId::get(),
                Error::<T>::AssetMismatch
            );
            ensure!(T::YieldSource::is_active(&strategy), Error::<T>::YieldSourceInactive);
            ensure!(allocation_bps <= MAX_BPS, Error::<T>::InvalidAllocation);

            let total = Self::total_allocation_bps()
                .checked_add(allocation_bps)
                .ok_or(ArithmeticError::Overflow)?;
            ensure!(total <= MAX_BPS, Error::<T>::AllocationExceedsMax);

            let index = list.len() as u32;
            list.try_push(strategy.clone())
                .map_err(|_| Error::<T>::TooManyStrategies)?;
            StrategyList::<T>::put(list);
            StrategyIndex::<T>::insert(&strategy, index);

            // A previously removed strategy keeps its history
            Strategies::<T>::mutate(&strategy, |entry| match entry {
                Some(info) => {
                    info.allocation_bps = allocation_bps;
                    info.total_deposited = Zero::zero();
                    info.is_active = true;
                }
                None => {
                    *entry = Some(StrategyInfo {
                        allocation_bps,
                        total_deposited: Zero::zero(),
                        total_profit: Zero::zero(),
                        last_harvest: 0,
                        is_active: true,
                    });
                }
            });

            log::info!(
                target: LOG_TARGET,
                "➕ Strategy {:?} added at {} bps (total {} bps)",
                strategy,
                allocation_bps,
                total
            );

            Self::deposit_event(Event::StrategyAdded { strategy, allocation_bps });

            Ok(())
        }

        pub fn do_remove_strategy(strategy: T::AccountId) -> DispatchResult {
            let index = StrategyIndex::<T>::get(&strategy).ok_or(Error::<T>::StrategyNotActive)?;

            let recovered = Self::pull_all(&strategy)?;
            ensure!(
                T::YieldSource::estimated_total_assets(&strategy).is_zero(),
                Error::<T>::StrategyStillHoldsCapital
            );
            Self::forward_to_vault(recovered)?;

            // Swap-with-last-and-pop keeps the registry dense
            let mut list = StrategyList::<T>::get();
            let index = index as usize;
            list.swap_remove(index);
            if let Some(moved) = list.get(index) {
                StrategyIndex::<T>::insert(moved, index as u32);
            }
            StrategyIndex::<T>::remove(&strategy);
            StrategyList::<T>::put(list);

            Strategies::<T>::mutate(&strategy, |entry| {
                if let Some(info) = entry {
                    info.allocation_bps = 0;
                    info.total_deposited = Zero::zero();
                    info.is_active = false;
                }
            });

            log::info!(
                target: LOG_TARGET,
                "➖ Strategy {:?} removed, {:?} returned to vault",
                strategy,
                recovered
            );

            Self::deposit_event(Event::StrategyRemoved { strategy, recovered });

            Ok(())
        }

        pub fn do_update_allocation(strategy: T::AccountId, new_bps: BasisPoints) -> DispatchResult {
            ensure!(
                StrategyIndex::<T>::contains_key(&strategy),
                Error::<T>::StrategyNotActive
            );
            ensure!(new_bps <= MAX_BPS, Error::<T>::InvalidAllocation);
            let mut info = Strategies::<T>::get(&strategy).ok_or(Error::<T>::StrategyNotActive)?;

            let others = Self::total_allocation_bps().saturating_sub(info.allocation_bps);
            let total = others.checked_add(new_bps).ok_or(ArithmeticError::Overflow)?;
            ensure!(total <= MAX_BPS, Error::<T>::AllocationExceedsMax);

            let old_bps = info.allocation_bps;
            info.allocation_bps = new_bps;
            Strategies::<T>::insert(&strategy, info);

            Self::deposit_event(Event::AllocationUpdated { strategy, old_bps, new_bps });

            Ok(())
        }

        /// Fan `amount` out of the vault custody account by weight.
        pub fn do_deposit_to_strategies(amount: T::Balance) -> Result<T::Balance, DispatchError> {
            let vault = T::Vault::custody_account();
            let total: u128 = amount.into();
            let mut remaining = amount;

            for strategy in StrategyList::<T>::get() {
                if remaining.is_zero() {
                    break;
                }
                let info = Strategies::<T>::get(&strategy).ok_or(Error::<T>::StrategyNotActive)?;
                if info.allocation_bps == 0 {
                    continue;
                }
                if !T::YieldSource::is_active(&strategy) {
                    log::warn!(
                        target: LOG_TARGET,
                        "⏸️ Strategy {:?} reports inactive, its share stays idle",
                        strategy
                    );
                    continue;
                }

                let target: T::Balance = bps_of(total, info.allocation_bps)?.into();
                let share = remaining.min(target);
                if share.is_zero() {
                    continue;
                }

                Self::push_to_strategy(&vault, &strategy, share)?;
                remaining = remaining.saturating_sub(share);
            }

            let deployed = amount.saturating_sub(remaining);

            log::info!(
                target: LOG_TARGET,
                "📤 Deployed {:?} of {:?} to strategies",
                deployed,
                amount
            );

            Self::deposit_event(Event::DeployedToStrategies { requested: amount, deployed });

            Ok(deployed)
        }

        /// Pull up to `amount` from strategies in registry order and forward
        /// whatever arrived to the vault.
        ///
        /// A strategy that reverts is skipped and its partial effects are
        /// discarded. The result may be smaller than `amount`; the caller
        /// decides whether that is acceptable.
        pub fn do_withdraw_from_strategies(amount: T::Balance) -> Result<T::Balance, DispatchError> {
            let staging = Self::account_id();
            let staged_before = Self::staged_balance();
            let mut remaining = amount;

            for strategy in StrategyList::<T>::get() {
                if remaining.is_zero() {
                    break;
                }
                let ask = remaining.min(T::YieldSource::estimated_total_assets(&strategy));
                if ask.is_zero() {
                    continue;
                }

                let before = Self::staged_balance();
                match with_storage_layer(|| T::YieldSource::withdraw(&strategy, ask, &staging)) {
                    Ok(_) => {
                        let received = Self::staged_balance().saturating_sub(before);
                        if received < ask {
                            log::warn!(
                                target: LOG_TARGET,
                                "⚠️ Strategy {:?} released {:?} of {:?} requested",
                                strategy,
                                received,
                                ask
                            );
                        }
                        Strategies::<T>::mutate(&strategy, |entry| {
                            if let Some(info) = entry {
                                info.total_deposited = info.total_deposited.saturating_sub(received);
                            }
                        });
                        remaining = remaining.saturating_sub(received);
                    }
                    Err(error) => {
                        log::error!(
                            target: LOG_TARGET,
                            "❌ Withdrawal from strategy {:?} reverted: {:?}",
                            strategy,
                            error
                        );
                        Self::deposit_event(Event::StrategyWithdrawFailed { strategy, error });
                    }
                }
            }

            let withdrawn = Self::staged_balance().saturating_sub(staged_before);
            Self::forward_to_vault(withdrawn)?;

            log::info!(
                target: LOG_TARGET,
                "📥 Withdrew {:?} of {:?} requested from strategies",
                withdrawn,
                amount
            );

            Self::deposit_event(Event::WithdrawnFromStrategies { requested: amount, withdrawn });

            Ok(withdrawn)
        }

        /// Realize rewards of one strategy. Returns the profit.
        ///
        /// A balance decrease is recorded as zero profit. The loss itself is
        /// still visible through the strategy's estimate.
        pub fn do_harvest(strategy: &T::AccountId) -> Result<T::Balance, DispatchError> {
            ensure!(
                StrategyIndex::<T>::contains_key(strategy),
                Error::<T>::StrategyNotActive
            );

            let staging = Self::account_id();
            let estimate_before = T::YieldSource::estimated_total_assets(strategy);
            let before = Self::staged_balance();

            T::YieldSource::harvest(strategy, &staging)?;

            let after = Self::staged_balance();
            let profit = after.saturating_sub(before);
            let estimate_after = T::YieldSource::estimated_total_assets(strategy);
            if estimate_after < estimate_before {
                log::warn!(
                    target: LOG_TARGET,
                    "📉 Strategy {:?} lost {:?} during harvest, recorded as zero",
                    strategy,
                    estimate_before.saturating_sub(estimate_after)
                );
            }

            let performance_fee = if profit.is_zero() {
                Zero::zero()
            } else {
                T::Assets::transfer(
                    T::VaultAssetId::get(),
                    &staging,
                    &T::Vault::custody_account(),
                    profit,
                    Preservation::Expendable,
                )
                .map_err(|_| Error::<T>::TransferFailed)?;
                T::Vault::on_profit_realized(profit)?
            };

            let now = Self::current_timestamp();
            Strategies::<T>::mutate(strategy, |entry| {
                if let Some(info) = entry {
                    info.last_harvest = now;
                    info.total_profit = info.total_profit.saturating_add(profit);
                }
            });
            TotalRealizedProfit::<T>::mutate(|total| {
                *total = total.saturating_add(profit);
            });

            log::info!(
                target: LOG_TARGET,
                "🌾 Harvested {:?} from strategy {:?} (performance fee {:?})",
                profit,
                strategy,
                performance_fee
            );

            Self::deposit_event(Event::Harvested {
                strategy: strategy.clone(),
                profit,
                performance_fee,
            });

            Ok(profit)
        }

        /// Harvest every active strategy, isolating each one.
        pub fn do_harvest_all() -> Result<T::Balance, DispatchError> {
            let mut total = T::Balance::zero();
            for strategy in StrategyList::<T>::get() {
                match with_storage_layer(|| Self::do_harvest(&strategy)) {
                    Ok(profit) => total = total.saturating_add(profit),
                    Err(error) => {
                        log::error!(
                            target: LOG_TARGET,
                            "❌ Harvest of strategy {:?} reverted: {:?}",
                            strategy,
                            error
                        );
                        Self::deposit_event(Event::HarvestFailed { strategy, error });
                    }
                }
            }
            Ok(total)
        }

        /// Drain every active strategy, then refill each by weight.
        ///
        /// Whatever a strategy could not release stays in it; whatever the
        /// weights leave unassigned goes back to the vault as idle capital.
        pub fn do_rebalance() -> DispatchResult {
            let list = StrategyList::<T>::get();
            let staging = Self::account_id();

            let mut recovered = T::Balance::zero();
            for strategy in list.iter() {
                recovered = recovered.saturating_add(Self::pull_all(strategy)?);
            }

            let pool: u128 = recovered.into();
            let mut redeployed = T::Balance::zero();
            for strategy in list.iter() {
                let info = Strategies::<T>::get(strategy).ok_or(Error::<T>::StrategyNotActive)?;
                if info.allocation_bps == 0 || !T::YieldSource::is_active(strategy) {
                    continue;
                }
                let share: T::Balance = bps_of(pool, info.allocation_bps)?.into();
                if share.is_zero() {
                    continue;
                }
                Self::push_to_strategy(&staging, strategy, share)?;
                redeployed = redeployed.saturating_add(share);
            }

            let returned_to_vault = recovered.saturating_sub(redeployed);
            Self::forward_to_vault(returned_to_vault)?;

            log::info!(
                target: LOG_TARGET,
                "🔄 Rebalanced: recovered {:?}, redeployed {:?}, returned {:?}",
                recovered,
                redeployed,
                returned_to_vault
            );

            Self::deposit_event(Event::Rebalanced { recovered, redeployed, returned_to_vault });

            Ok(())
        }

        /// Call every strategy's emergency exit, swallowing individual failures.
        pub fn do_emergency_withdraw_all() -> Result<T::Balance, DispatchError> {
            let staging = Self::account_id();
            let staged_before = Self::staged_balance();

            for strategy in StrategyList::<T>::get() {
                match with_storage_layer(|| T::YieldSource::emergency_withdraw(&strategy, &staging)) {
                    Ok(()) => {
                        Strategies::<T>::mutate(&strategy, |entry| {
                            if let Some(info) = entry {
                                info.total_deposited = Zero::zero();
                            }
                        });
                    }
                    Err(error) => {
                        log::error!(
                            target: LOG_TARGET,
                            "🚨 Emergency withdrawal from strategy {:?} failed: {:?}",
                            strategy,
                            error
                        );
                        Self::deposit_event(Event::EmergencyWithdrawFailed { strategy, error });
                    }
                }
            }

            let recovered = Self::staged_balance().saturating_sub(staged_before);
            Self::forward_to_vault(recovered)?;

            log::warn!(
                target: LOG_TARGET,
                "🚨 Emergency withdrawal recovered {:?} to the vault",
                recovered
            );

            Self::deposit_event(Event::EmergencyWithdrawn { recovered });

            Ok(recovered)
        }

        /// Withdraw everything a strategy will release into staging.
        fn pull_all(strategy: &T::AccountId) -> Result<T::Balance, DispatchError> {
            let before = Self::staged_balance();
            let reported = T::YieldSource::withdraw_all(strategy, &Self::account_id())?;
            let received = Self::staged_balance().saturating_sub(before);
            if received != reported {
                log::warn!(
                    target: LOG_TARGET,
                    "⚠️ Strategy {:?} reported {:?} but delivered {:?}",
                    strategy,
                    reported,
                    received
                );
            }
            Strategies::<T>::mutate(strategy, |entry| {
                if let Some(info) = entry {
                    info.total_deposited = Zero::zero();
                }
            });
            Ok(received)
        }

        fn push_to_strategy(
            from: &T::AccountId,
            strategy: &T::AccountId,
            amount: T::Balance,
        ) -> DispatchResult {
            T::Assets::transfer(
                T::VaultAssetId::get(),
                from,
                strategy,
                amount,
                Preservation::Expendable,
            )
            .map_err(|_| Error::<T>::TransferFailed)?;

            T::YieldSource::deposit(strategy)?;

            Strategies::<T>::mutate(strategy, |entry| {
                if let Some(info) = entry {
                    info.total_deposited = info.total_deposited.saturating_add(amount);
                }
            });
            Ok(())
        }

        fn forward_to_vault(amount: T::Balance) -> DispatchResult {
            if amount.is_zero() {
                return Ok(());
            }
            T::Assets::transfer(
                T::VaultAssetId::get(),
                &Self::account_id(),
                &T::Vault::custody_account(),
                amount,
                Preservation::Expendable,
            )
            .map_err(|_| Error::<T>::TransferFailed)?;
            T::Vault::on_capital_returned(amount)
        }

        /// Registry and custody invariants.
        #[cfg(any(feature = "try-runtime", test))]
        pub fn do_try_state() -> Result<(), DispatchError> {
            ensure!(
                Self::total_allocation_bps() <= MAX_BPS,
                DispatchError::Other("active allocation exceeds 10_000 bps")
            );

            let list = StrategyList::<T>::get();
            ensure!(
                StrategyIndex::<T>::iter().count() == list.len(),
                DispatchError::Other("strategy index out of sync with registry")
            );
            for (position, strategy) in list.iter().enumerate() {
                ensure!(
                    StrategyIndex::<T>::get(strategy) == Some(position as u32),
                    DispatchError::Other("strategy index points at the wrong slot")
                );
                ensure!(
                    Strategies::<T>::get(strategy).map_or(false, |info| info.is_active),
                    DispatchError::Other("listed strategy is not active")
                );
            }

            ensure!(
                Self::staged_balance().is_zero(),
                DispatchError::Other("staging account holds capital between calls")
            );

            Ok(())
        }
    }
}

// =============================================================================
//                       StrategyManager Implementation
// =============================================================================

// The vault calls in while holding its own lock, so these do not take it again.
impl<T: Config> StrategyManager<T::AccountId, T::Balance> for Pallet<T> {
    fn total_assets_in_strategies() -> Result<T::Balance, DispatchError> {
        pallet::Pallet::<T>::total_assets_in_strategies()
    }

    fn deposit_to_strategies(amount: T::Balance) -> Result<T::Balance, DispatchError> {
        Self::do_deposit_to_strategies(amount)
    }

    fn withdraw_from_strategies(amount: T::Balance) -> Result<T::Balance, DispatchError> {
        Self::do_withdraw_from_strategies(amount)
    }

    fn emergency_withdraw_all() -> Result<T::Balance, DispatchError> {
        Self::do_emergency_withdraw_all()
    }
}
