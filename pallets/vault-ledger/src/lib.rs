//! # Vault Ledger Pallet
//!
//! This pallet is the accounting side of the single-asset vault. Users deposit
//! the vault asset and receive shares that represent a proportional claim on
//! everything the vault holds, idle or deployed.
//!
//! ## Overview
//!
//! - `deposit` / `mint` and `withdraw` / `redeem` are the two exact-amount
//!   pairs for entering and leaving the vault.
//! - Conversions always round in the vault's favour (see [`Pallet::preview_deposit`]
//!   and friends).
//! - Withdrawals that exceed the idle balance pull the shortfall from the
//!   strategy manager. An under-delivered pull fails the withdrawal.
//! - Shares are transferable and can be delegated through allowances.
//!
//! ## Custody
//!
//! The pallet account holds the idle capital. `IdleAssets` tracks it as a
//! counter so that direct transfers into the account cannot move the
//! exchange rate.
//!
//! ## Key Invariants
//!
//! 1. **Supply**: Σ `ShareBalances` == `TotalShares`
//! 2. **Conservation**: `total_assets` == idle + Σ strategy estimates
//! 3. **Fee Caps**: withdrawal fee ≤ 100 bps, performance fee ≤ 2_000 bps
//!
//! ## Re-entrancy
//!
//! `Locked` is the only lock in the vault. The allocator takes it through
//! [`VaultCustody::guarded`], so a strategy hook reached from either pallet
//! cannot call back into any guarded entry point.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub use pallet::*;

#[cfg(test)]
mod mock;


use frame_support::traits::fungibles::{Inspect, Mutate};
use frame_support::traits::tokens::Preservation;
use frame_support::traits::Get;
use sp_runtime::traits::{AccountIdConversion, Zero};
use sp_runtime::{ArithmeticError, DispatchError, DispatchResult};
use vault_primitives::{
    bps_of, mul_div, BasisPoints, Rounding, Shares, StrategyManager, VaultCustody,
    INFINITE_ALLOWANCE, MAX_PERFORMANCE_FEE_BPS, MAX_WITHDRAWAL_FEE_BPS,
};

const LOG_TARGET: &str = "vault-ledger";

#[frame_support::pallet]
pub mod pallet {
    use super::*;
    use alloc::vec::Vec;
    use frame_support::pallet_prelude::*;
    use frame_support::PalletId;
    use frame_system::pallet_prelude::*;
    use sp_runtime::traits::{MaybeSerializeDeserialize, Saturating};

    // =========================================================================
    //                                  Config
    // =========================================================================

    #[pallet::config]
    pub trait Config: frame_system::Config {
        type RuntimeEvent: From<Event<Self>> + IsType<<Self as frame_system::Config>::RuntimeEvent>;

        /// Balance type of the vault asset
        type Balance: Parameter
            + Member
            + From<u128>
            + Into<u128>
            + Copy
            + Default
            + MaxEncodedLen
            + MaybeSerializeDeserialize
            + Zero
            + Ord
            + Saturating;

        /// Asset ID type
        type AssetId: Parameter + Member + Copy + Default + MaxEncodedLen;

        /// Fungibles implementation holding the vault asset
        type Assets: Mutate<Self::AccountId, AssetId = Self::AssetId, Balance = Self::Balance>
            + Inspect<Self::AccountId>;

        /// The single asset the vault accepts
        #[pallet::constant]
        type VaultAssetId: Get<Self::AssetId>;

        /// Orchestrator that deploys idle capital into strategies
        type StrategyManager: StrategyManager<Self::AccountId, Self::Balance>;

        /// Origin allowed to change limits, fees and push idle capital
        type AdminOrigin: EnsureOrigin<Self::RuntimeOrigin>;

        /// Origin allowed to pause and trigger an emergency withdrawal
        type GuardianOrigin: EnsureOrigin<Self::RuntimeOrigin>;

        /// Pallet ID for the custody account
        #[pallet::constant]
        type PalletId: Get<PalletId>;
    }

    // =========================================================================
    //                                  Storage
    // =========================================================================

    #[pallet::pallet]
    pub struct Pallet<T>(_);

    /// Total shares in circulation
    #[pallet::storage]
    #[pallet::getter(fn total_shares)]
    pub type TotalShares<T: Config> = StorageValue<_, Shares, ValueQuery>;

    /// Shares held per account
    #[pallet::storage]
    #[pallet::getter(fn balance_of)]
    pub type ShareBalances<T: Config> =
        StorageMap<_, Blake2_128Concat, T::AccountId, Shares, ValueQuery>;

    /// Shares `spender` may move on behalf of `owner`
    #[pallet::storage]
    #[pallet::getter(fn allowance)]
    pub type Allowances<T: Config> = StorageDoubleMap<
        _,
        Blake2_128Concat,
        T::AccountId,
        Blake2_128Concat,
        T::AccountId,
        Shares,
        ValueQuery,
    >;

    /// Vault asset held by the custody account and not deployed
    #[pallet::storage]
    #[pallet::getter(fn idle_assets)]
    pub type IdleAssets<T: Config> = StorageValue<_, T::Balance, ValueQuery>;

    /// Upper bound on total assets. `None` means unlimited.
    #[pallet::storage]
    #[pallet::getter(fn deposit_limit)]
    pub type DepositLimit<T: Config> = StorageValue<_, T::Balance, OptionQuery>;

    #[pallet::storage]
    #[pallet::getter(fn withdrawal_fee_bps)]
    pub type WithdrawalFeeBps<T: Config> = StorageValue<_, BasisPoints, ValueQuery>;

    #[pallet::storage]
    #[pallet::getter(fn performance_fee_bps)]
    pub type PerformanceFeeBps<T: Config> = StorageValue<_, BasisPoints, ValueQuery>;

    #[pallet::storage]
    #[pallet::getter(fn fee_recipient)]
    pub type FeeRecipient<T: Config> = StorageValue<_, T::AccountId, OptionQuery>;

    /// Deposits are refused while set. Withdrawals are never blocked.
    #[pallet::storage]
    #[pallet::getter(fn paused)]
    pub type Paused<T: Config> = StorageValue<_, bool, ValueQuery>;

    #[pallet::type_value]
    pub fn DefaultAttached() -> bool {
        true
    }

    /// Whether the strategy manager counts towards total assets and may be
    /// asked for liquidity
    #[pallet::storage]
    #[pallet::getter(fn strategy_manager_attached)]
    pub type StrategyManagerAttached<T: Config> =
        StorageValue<_, bool, ValueQuery, DefaultAttached>;

    /// Re-entrancy flag
    #[pallet::storage]
    pub type Locked<T: Config> = StorageValue<_, bool, ValueQuery>;

    // =========================================================================
    //                              Genesis Config
    // =========================================================================

    #[pallet::genesis_config]
    #[derive(frame_support::DefaultNoBound)]
    pub struct GenesisConfig<T: Config> {
        pub deposit_limit: Option<T::Balance>,
        pub withdrawal_fee_bps: BasisPoints,
        pub performance_fee_bps: BasisPoints,
        pub fee_recipient: Option<T::AccountId>,
        pub paused: bool,
    }

    #[pallet::genesis_build]
    impl<T: Config> BuildGenesisConfig for GenesisConfig<T> {
        fn build(&self) {
            assert!(
                self.withdrawal_fee_bps <= MAX_WITHDRAWAL_FEE_BPS,
                "Withdrawal fee above cap"
            );
            assert!(
                self.performance_fee_bps <= MAX_PERFORMANCE_FEE_BPS,
                "Performance fee above cap"
            );
            assert!(
                self.fee_recipient.is_some()
                    || (self.withdrawal_fee_bps == 0 && self.performance_fee_bps == 0),
                "Fees configured without a fee recipient"
            );

            if let Some(limit) = self.deposit_limit {
                DepositLimit::<T>::put(limit);
            }
            WithdrawalFeeBps::<T>::put(self.withdrawal_fee_bps);
            PerformanceFeeBps::<T>::put(self.performance_fee_bps);
            if let Some(recipient) = &self.fee_recipient {
                FeeRecipient::<T>::put(recipient);
            }
            Paused::<T>::put(self.paused);
        }
    }

    // =========================================================================
    //                                  Events
    // =========================================================================

    #[pallet::event]
    #[pallet::generate_deposit(pub(super) fn deposit_event)]
    pub enum Event<T: Config> {
        /// Assets deposited for shares. [caller, receiver, assets, shares]
        Deposited {
            caller: T::AccountId,
            receiver: T::AccountId,
            assets: T::Balance,
            shares: Shares,
        },
        /// Shares burned for assets. [caller, receiver, owner, assets, shares, fee]
        Withdrawn {
            caller: T::AccountId,
            receiver: T::AccountId,
            owner: T::AccountId,
            assets: T::Balance,
            shares: Shares,
            fee: T::Balance,
        },
        /// Shares moved between accounts. [from, to, shares]
        SharesTransferred {
            from: T::AccountId,
            to: T::AccountId,
            shares: Shares,
        },
        /// Allowance set. [owner, spender, shares]
        Approval {
            owner: T::AccountId,
            spender: T::AccountId,
            shares: Shares,
        },
        /// Shortfall pulled from strategies. [requested, withdrawn]
        LiquidityPulled {
            requested: T::Balance,
            withdrawn: T::Balance,
        },
        /// Idle capital pushed to strategies. [requested, deployed]
        IdleDeployed {
            requested: T::Balance,
            deployed: T::Balance,
        },
        /// Harvest profit credited. [profit, performance_fee]
        ProfitRealized {
            profit: T::Balance,
            performance_fee: T::Balance,
        },
        DepositLimitSet {
            limit: Option<T::Balance>,
        },
        FeesSet {
            withdrawal_fee_bps: BasisPoints,
            performance_fee_bps: BasisPoints,
        },
        FeeRecipientSet {
            recipient: T::AccountId,
        },
        StrategyManagerSet {
            attached: bool,
        },
        VaultPaused,
        VaultUnpaused,
        /// Every strategy force-liquidated. [recovered]
        EmergencyWithdrawal {
            recovered: T::Balance,
        },
    }

    // =========================================================================
    //                                  Errors
    // =========================================================================

    #[pallet::error]
    pub enum Error<T> {
        /// Amount must be greater than zero.
        ZeroAmount,
        /// Operation would mint or burn zero shares.
        ZeroShares,
        /// Operation would move zero assets.
        ZeroAssets,
        /// Deposit exceeds the limit or the vault is paused.
        ExceedsMaxDeposit,
        /// Mint exceeds the limit or the vault is paused.
        ExceedsMaxMint,
        /// Owner does not hold enough shares.
        InsufficientShares,
        /// Caller is not allowed to move that many shares.
        InsufficientAllowance,
        /// Fee above its hard cap.
        FeeTooHigh,
        /// Non-zero fee requires a fee recipient.
        FeeRecipientNotSet,
        /// The custody account cannot receive fees.
        InvalidFeeRecipient,
        /// Shares exist but nothing backs them.
        NoAssetsBackingShares,
        /// Strategies still hold capital.
        StrategiesStillFunded,
        /// Strategy manager is detached.
        StrategyManagerDetached,
        /// Strategies could not deliver enough capital.
        InsufficientLiquidity,
        /// Asset transfer failed.
        TransferFailed,
        /// A guarded call was entered while another was in flight.
        Reentrancy,
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
        /// Deposit exactly `assets` and mint the corresponding shares to `receiver`.
        #[pallet::call_index(0)]
        #[pallet::weight(Weight::from_parts(50_000, 0))]
        pub fn deposit(
            origin: OriginFor<T>,
            assets: T::Balance,
            receiver: T::AccountId,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;

            Self::guarded(|| Self::do_deposit(who, assets, receiver).map(|_| ()))
        }

        /// Mint exactly `shares` to `receiver`, paying the rounded-up asset cost.
        #[pallet::call_index(1)]
        #[pallet::weight(Weight::from_parts(50_000, 0))]
        pub fn mint(origin: OriginFor<T>, shares: Shares, receiver: T::AccountId) -> DispatchResult {
            let who = ensure_signed(origin)?;

            Self::guarded(|| Self::do_mint(who, shares, receiver).map(|_| ()))
        }

        /// Withdraw exactly `assets` (gross of fee) from `owner`'s position.
        #[pallet::call_index(2)]
        #[pallet::weight(Weight::from_parts(150_000, 0))]
        pub fn withdraw(
            origin: OriginFor<T>,
            assets: T::Balance,
            receiver: T::AccountId,
            owner: T::AccountId,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;

            Self::guarded(|| Self::do_withdraw(who, assets, receiver, owner).map(|_| ()))
        }

        /// Burn exactly `shares` from `owner` and pay out their asset value.
        #[pallet::call_index(3)]
        #[pallet::weight(Weight::from_parts(150_000, 0))]
        pub fn redeem(
            origin: OriginFor<T>,
            shares: Shares,
            receiver: T::AccountId,
            owner: T::AccountId,
        ) -> DispatchResult {
            let who = ensure_signed(origin)?;

            Self::guarded(|| Self::do_redeem(who, shares, receiver, owner).map(|_| ()))
        }

        #[pallet::call_index(4)]
        #[pallet::weight(Weight::from_parts(20_000, 0))]
        pub fn transfer_shares(origin: OriginFor<T>, to: T::AccountId, shares: Shares) -> DispatchResult {
            let who = ensure_signed(origin)?;

            Self::guarded(|| Self::do_transfer_shares(&who, &to, shares))
        }

        /// Allow `spender` to burn up to `shares` of the caller's position.
        /// `u128::MAX` is never decremented.
        #[pallet::call_index(5)]
        #[pallet::weight(Weight::from_parts(10_000, 0))]
        pub fn approve(origin: OriginFor<T>, spender: T::AccountId, shares: Shares) -> DispatchResult {
            let owner = ensure_signed(origin)?;

            Allowances::<T>::insert(&owner, &spender, shares);
            Self::deposit_event(Event::Approval { owner, spender, shares });

            Ok(())
        }

        #[pallet::call_index(6)]
        #[pallet::weight(Weight::from_parts(10_000, 0))]
        pub fn set_deposit_limit(origin: OriginFor<T>, limit: Option<T::Balance>) -> DispatchResult {
            T::AdminOrigin::ensure_origin(origin)?;

            DepositLimit::<T>::set(limit);
            Self::deposit_event(Event::DepositLimitSet { limit });

            Ok(())
        }

        /// Set both fees. Caps are enforced here, not at use.
        #[pallet::call_index(7)]
        #[pallet::weight(Weight::from_parts(10_000, 0))]
        pub fn set_fees(
            origin: OriginFor<T>,
            withdrawal_fee_bps: BasisPoints,
            performance_fee_bps: BasisPoints,
        ) -> DispatchResult {
            T::AdminOrigin::ensure_origin(origin)?;

            ensure!(withdrawal_fee_bps <= MAX_WITHDRAWAL_FEE_BPS, Error::<T>::FeeTooHigh);
            ensure!(performance_fee_bps <= MAX_PERFORMANCE_FEE_BPS, Error::<T>::FeeTooHigh);
            ensure!(
                FeeRecipient::<T>::get().is_some()
                    || (withdrawal_fee_bps == 0 && performance_fee_bps == 0),
                Error::<T>::FeeRecipientNotSet
            );

            WithdrawalFeeBps::<T>::put(withdrawal_fee_bps);
            PerformanceFeeBps::<T>::put(performance_fee_bps);

            Self::deposit_event(Event::FeesSet { withdrawal_fee_bps, performance_fee_bps });

            Ok(())
        }

        #[pallet::call_index(8)]
        #[pallet::weight(Weight::from_parts(10_000, 0))]
        pub fn set_fee_recipient(origin: OriginFor<T>, recipient: T::AccountId) -> DispatchResult {
            T::AdminOrigin::ensure_origin(origin)?;

            ensure!(recipient != Self::account_id(), Error::<T>::InvalidFeeRecipient);
            FeeRecipient::<T>::put(&recipient);

            Self::deposit_event(Event::FeeRecipientSet { recipient });

            Ok(())
        }

        /// Attach or detach the strategy manager. Detaching requires every
        /// strategy to be empty.
        #[pallet::call_index(9)]
        #[pallet::weight(Weight::from_parts(20_000, 0))]
        pub fn set_strategy_manager(origin: OriginFor<T>, attached: bool) -> DispatchResult {
            T::AdminOrigin::ensure_origin(origin)?;

            if !attached {
                ensure!(
                    T::StrategyManager::total_assets_in_strategies()?.is_zero(),
                    Error::<T>::StrategiesStillFunded
                );
            }
            StrategyManagerAttached::<T>::put(attached);

            Self::deposit_event(Event::StrategyManagerSet { attached });

            Ok(())
        }

        /// Push idle capital to strategies. `None` pushes the whole idle balance.
        #[pallet::call_index(10)]
        #[pallet::weight(Weight::from_parts(300_000, 0))]
        pub fn deposit_idle_to_strategies(
            origin: OriginFor<T>,
            amount: Option<T::Balance>,
        ) -> DispatchResult {
            T::AdminOrigin::ensure_origin(origin)?;

            Self::guarded(|| Self::do_deposit_idle_to_strategies(amount).map(|_| ()))
        }

        #[pallet::call_index(11)]
        #[pallet::weight(Weight::from_parts(10_000, 0))]
        pub fn pause(origin: OriginFor<T>) -> DispatchResult {
            T::GuardianOrigin::ensure_origin(origin)?;

            Paused::<T>::put(true);
            log::warn!(target: LOG_TARGET, "⏸️ Vault paused, deposits refused");
            Self::deposit_event(Event::VaultPaused);

            Ok(())
        }

        #[pallet::call_index(12)]
        #[pallet::weight(Weight::from_parts(10_000, 0))]
        pub fn unpause(origin: OriginFor<T>) -> DispatchResult {
            T::GuardianOrigin::ensure_origin(origin)?;

            Paused::<T>::put(false);
            log::info!(target: LOG_TARGET, "▶️ Vault unpaused");
            Self::deposit_event(Event::VaultUnpaused);

            Ok(())
        }

        /// Force-liquidate every strategy back to the idle balance.
        #[pallet::call_index(13)]
        #[pallet::weight(Weight::from_parts(500_000, 0))]
        pub fn emergency_withdraw_all(origin: OriginFor<T>) -> DispatchResult {
            T::GuardianOrigin::ensure_origin(origin)?;

            Self::guarded(|| {
                let recovered = T::StrategyManager::emergency_withdraw_all()?;

                log::warn!(
                    target: LOG_TARGET,
                    "🚨 Emergency withdrawal returned {:?} to idle",
                    recovered
                );

                Self::deposit_event(Event::EmergencyWithdrawal { recovered });
                Ok(())
            })
        }
    }

    // =========================================================================
    //                           Internal Functions
    // =========================================================================

    impl<T: Config> Pallet<T> {
        /// Custody account holding the idle capital
        pub fn account_id() -> T::AccountId {
            T::PalletId::get().into_account_truncating()
        }

        /// Run `f` under the vault lock shared with the allocator.
        pub(crate) fn guarded<R>(
            f: impl FnOnce() -> Result<R, DispatchError>,
        ) -> Result<R, DispatchError> {
            ensure!(!Locked::<T>::get(), Error::<T>::Reentrancy);
            Locked::<T>::put(true);
            let result = f();
            Locked::<T>::kill();
            result
        }

        // ---------------------------------------------------------------------
        //                        Accounting views
        // ---------------------------------------------------------------------

        /// Idle balance plus whatever the strategies estimate they hold
        pub fn total_assets() -> Result<T::Balance, DispatchError> {
            let idle: u128 = IdleAssets::<T>::get().into();
            if !StrategyManagerAttached::<T>::get() {
                return Ok(idle.into());
            }
            let deployed: u128 = T::StrategyManager::total_assets_in_strategies()?.into();
            let total = idle.checked_add(deployed).ok_or(ArithmeticError::Overflow)?;
            Ok(total.into())
        }

        fn to_shares(assets: u128, rounding: Rounding) -> Result<Shares, DispatchError> {
            let supply = TotalShares::<T>::get();
            if supply == 0 {
                return Ok(assets);
            }
            let total: u128 = Self::total_assets()?.into();
            ensure!(total > 0, Error::<T>::NoAssetsBackingShares);
            Ok(mul_div(assets, supply, total, rounding)?)
        }

        fn to_assets(shares: Shares, rounding: Rounding) -> Result<u128, DispatchError> {
            let supply = TotalShares::<T>::get();
            if supply == 0 {
                return Ok(shares);
            }
            let total: u128 = Self::total_assets()?.into();
            Ok(mul_div(shares, total, supply, rounding)?)
        }

        pub fn convert_to_shares(assets: T::Balance) -> Result<Shares, DispatchError> {
            Self::to_shares(assets.into(), Rounding::Down)
        }

        pub fn convert_to_assets(shares: Shares) -> Result<T::Balance, DispatchError> {
            Self::to_assets(shares, Rounding::Down).map(Into::into)
        }

        /// Shares minted for `assets`, rounded down.
        pub fn preview_deposit(assets: T::Balance) -> Result<Shares, DispatchError> {
            Self::to_shares(assets.into(), Rounding::Down)
        }

        /// Assets charged for `shares`, rounded up.
        pub fn preview_mint(shares: Shares) -> Result<T::Balance, DispatchError> {
            Self::to_assets(shares, Rounding::Up).map(Into::into)
        }

        /// Shares burned for `assets`, rounded up.
        pub fn preview_withdraw(assets: T::Balance) -> Result<Shares, DispatchError> {
            Self::to_shares(assets.into(), Rounding::Up)
        }

        /// Assets paid for `shares`, rounded down.
        pub fn preview_redeem(shares: Shares) -> Result<T::Balance, DispatchError> {
            Self::to_assets(shares, Rounding::Down).map(Into::into)
        }

        pub fn max_deposit(_receiver: &T::AccountId) -> T::Balance {
            if Paused::<T>::get() {
                return Zero::zero();
            }
            match DepositLimit::<T>::get() {
                Some(limit) => Self::total_assets()
                    .map(|total| limit.saturating_sub(total))
                    .unwrap_or_else(|_| Zero::zero()),
                None => T::Balance::from(u128::MAX),
            }
        }

        pub fn max_mint(receiver: &T::AccountId) -> Shares {
            if Paused::<T>::get() {
                return 0;
            }
            match DepositLimit::<T>::get() {
                Some(_) => Self::convert_to_shares(Self::max_deposit(receiver)).unwrap_or(0),
                None => Shares::MAX,
            }
        }

        pub fn max_withdraw(owner: &T::AccountId) -> T::Balance {
            Self::preview_redeem(ShareBalances::<T>::get(owner)).unwrap_or_else(|_| Zero::zero())
        }

        pub fn max_redeem(owner: &T::AccountId) -> Shares {
            ShareBalances::<T>::get(owner)
        }

        /// Full dump of the share ledger
        pub fn share_ledger_snapshot() -> Vec<(T::AccountId, Shares)> {
            ShareBalances::<T>::iter().collect()
        }

        // ---------------------------------------------------------------------
        //                         Entry / exit
        // ---------------------------------------------------------------------

        pub fn do_deposit(
            caller: T::AccountId,
            assets: T::Balance,
            receiver: T::AccountId,
        ) -> Result<Shares, DispatchError> {
            ensure!(!assets.is_zero(), Error::<T>::ZeroAmount);
            ensure!(assets <= Self::max_deposit(&receiver), Error::<T>::ExceedsMaxDeposit);

            let shares = Self::preview_deposit(assets)?;
            ensure!(shares > 0, Error::<T>::ZeroShares);

            Self::enter(caller, receiver, assets, shares)?;
            Ok(shares)
        }

        pub fn do_mint(
            caller: T::AccountId,
            shares: Shares,
            receiver: T::AccountId,
        ) -> Result<T::Balance, DispatchError> {
            ensure!(shares > 0, Error::<T>::ZeroShares);
            ensure!(shares <= Self::max_mint(&receiver), Error::<T>::ExceedsMaxMint);

            let assets = Self::preview_mint(shares)?;
            ensure!(!assets.is_zero(), Error::<T>::ZeroAssets);
            ensure!(assets <= Self::max_deposit(&receiver), Error::<T>::ExceedsMaxDeposit);

            Self::enter(caller, receiver, assets, shares)?;
            Ok(assets)
        }

        pub fn do_withdraw(
            caller: T::AccountId,
            assets: T::Balance,
            receiver: T::AccountId,
            owner: T::AccountId,
        ) -> Result<Shares, DispatchError> {
            ensure!(!assets.is_zero(), Error::<T>::ZeroAmount);

            let shares = Self::preview_withdraw(assets)?;
            Self::exit(caller, receiver, owner, assets, shares)?;
            Ok(shares)
        }

        pub fn do_redeem(
            caller: T::AccountId,
            shares: Shares,
            receiver: T::AccountId,
            owner: T::AccountId,
        ) -> Result<T::Balance, DispatchError> {
            ensure!(shares > 0, Error::<T>::ZeroShares);

            let assets = Self::preview_redeem(shares)?;
            ensure!(!assets.is_zero(), Error::<T>::ZeroAssets);

            Self::exit(caller, receiver, owner, assets, shares)?;
            Ok(assets)
        }

        fn enter(
            caller: T::AccountId,
            receiver: T::AccountId,
            assets: T::Balance,
            shares: Shares,
        ) -> DispatchResult {
            T::Assets::transfer(
                T::VaultAssetId::get(),
                &caller,
                &Self::account_id(),
                assets,
                Preservation::Expendable,
            )
            .map_err(|_| Error::<T>::TransferFailed)?;

            Self::credit_idle(assets)?;
            Self::mint_shares(&receiver, shares)?;

            log::info!(
                target: LOG_TARGET,
                "💰 {:?} deposited {:?} for {} shares to {:?}",
                caller,
                assets,
                shares,
                receiver
            );

            Self::deposit_event(Event::Deposited { caller, receiver, assets, shares });

            Ok(())
        }

        fn exit(
            caller: T::AccountId,
            receiver: T::AccountId,
            owner: T::AccountId,
            assets: T::Balance,
            shares: Shares,
        ) -> DispatchResult {
            ensure!(
                ShareBalances::<T>::get(&owner) >= shares,
                Error::<T>::InsufficientShares
            );
            if caller != owner {
                Self::spend_allowance(&owner, &caller, shares)?;
            }

            Self::burn_shares(&owner, shares)?;
            Self::ensure_liquidity(assets)?;

            let fee: T::Balance = match FeeRecipient::<T>::get() {
                Some(_) => bps_of(assets.into(), WithdrawalFeeBps::<T>::get())?.into(),
                None => Zero::zero(),
            };
            let net = assets.saturating_sub(fee);

            Self::debit_idle(assets)?;
            if let Some(recipient) = FeeRecipient::<T>::get() {
                Self::pay_out(&recipient, fee)?;
            }
            Self::pay_out(&receiver, net)?;

            log::info!(
                target: LOG_TARGET,
                "💸 {:?} redeemed {} shares of {:?} for {:?} (fee {:?})",
                caller,
                shares,
                owner,
                assets,
                fee
            );

            Self::deposit_event(Event::Withdrawn { caller, receiver, owner, assets, shares, fee });

            Ok(())
        }

        /// Make sure the idle balance covers `amount`, pulling the shortfall
        /// from strategies. An under-delivered pull is an error.
        fn ensure_liquidity(amount: T::Balance) -> DispatchResult {
            let idle = IdleAssets::<T>::get();
            if idle >= amount {
                return Ok(());
            }
            ensure!(
                StrategyManagerAttached::<T>::get(),
                Error::<T>::InsufficientLiquidity
            );

            let shortfall = amount.saturating_sub(idle);
            let withdrawn = T::StrategyManager::withdraw_from_strategies(shortfall)?;
            if withdrawn < shortfall {
                log::warn!(
                    target: LOG_TARGET,
                    "⚠️ Strategies delivered {:?} of {:?} shortfall",
                    withdrawn,
                    shortfall
                );
            }

            Self::deposit_event(Event::LiquidityPulled { requested: shortfall, withdrawn });

            ensure!(
                IdleAssets::<T>::get() >= amount,
                Error::<T>::InsufficientLiquidity
            );
            Ok(())
        }

        pub fn do_deposit_idle_to_strategies(
            amount: Option<T::Balance>,
        ) -> Result<T::Balance, DispatchError> {
            ensure!(
                StrategyManagerAttached::<T>::get(),
                Error::<T>::StrategyManagerDetached
            );
            let idle = IdleAssets::<T>::get();
            let requested = amount.unwrap_or(idle);
            ensure!(!requested.is_zero(), Error::<T>::ZeroAmount);
            ensure!(requested <= idle, Error::<T>::InsufficientLiquidity);

            let deployed = T::StrategyManager::deposit_to_strategies(requested)?;
            Self::debit_idle(deployed)?;

            log::info!(
                target: LOG_TARGET,
                "📤 Pushed {:?} of {:?} idle to strategies",
                deployed,
                requested
            );

            Self::deposit_event(Event::IdleDeployed { requested, deployed });

            Ok(deployed)
        }

        pub fn do_transfer_shares(
            from: &T::AccountId,
            to: &T::AccountId,
            shares: Shares,
        ) -> DispatchResult {
            ensure!(shares > 0, Error::<T>::ZeroShares);

            ShareBalances::<T>::try_mutate(from, |balance| -> DispatchResult {
                *balance = balance
                    .checked_sub(shares)
                    .ok_or(Error::<T>::InsufficientShares)?;
                Ok(())
            })?;
            ShareBalances::<T>::try_mutate(to, |balance| -> DispatchResult {
                *balance = balance.checked_add(shares).ok_or(ArithmeticError::Overflow)?;
                Ok(())
            })?;

            Self::deposit_event(Event::SharesTransferred {
                from: from.clone(),
                to: to.clone(),
                shares,
            });

            Ok(())
        }

        // ---------------------------------------------------------------------
        //                         Book-keeping
        // ---------------------------------------------------------------------

        fn spend_allowance(owner: &T::AccountId, spender: &T::AccountId, shares: Shares) -> DispatchResult {
            let current = Allowances::<T>::get(owner, spender);
            if current == INFINITE_ALLOWANCE {
                return Ok(());
            }
            let remaining = current
                .checked_sub(shares)
                .ok_or(Error::<T>::InsufficientAllowance)?;
            Allowances::<T>::insert(owner, spender, remaining);
            Ok(())
        }

        fn mint_shares(to: &T::AccountId, shares: Shares) -> DispatchResult {
            ShareBalances::<T>::try_mutate(to, |balance| -> DispatchResult {
                *balance = balance.checked_add(shares).ok_or(ArithmeticError::Overflow)?;
                Ok(())
            })?;
            TotalShares::<T>::try_mutate(|total| -> DispatchResult {
                *total = total.checked_add(shares).ok_or(ArithmeticError::Overflow)?;
                Ok(())
            })
        }

        fn burn_shares(from: &T::AccountId, shares: Shares) -> DispatchResult {
            ShareBalances::<T>::try_mutate(from, |balance| -> DispatchResult {
                *balance = balance
                    .checked_sub(shares)
                    .ok_or(Error::<T>::InsufficientShares)?;
                Ok(())
            })?;
            TotalShares::<T>::try_mutate(|total| -> DispatchResult {
                *total = total.checked_sub(shares).ok_or(ArithmeticError::Underflow)?;
                Ok(())
            })
        }

        pub(crate) fn credit_idle(amount: T::Balance) -> DispatchResult {
            IdleAssets::<T>::try_mutate(|idle| -> DispatchResult {
                let current: u128 = (*idle).into();
                *idle = current
                    .checked_add(amount.into())
                    .ok_or(ArithmeticError::Overflow)?
                    .into();
                Ok(())
            })
        }

        fn debit_idle(amount: T::Balance) -> DispatchResult {
            IdleAssets::<T>::try_mutate(|idle| -> DispatchResult {
                let current: u128 = (*idle).into();
                *idle = current
                    .checked_sub(amount.into())
                    .ok_or(Error::<T>::InsufficientLiquidity)?
                    .into();
                Ok(())
            })
        }

        fn pay_out(to: &T::AccountId, amount: T::Balance) -> DispatchResult {
            if amount.is_zero() {
                return Ok(());
            }
            T::Assets::transfer(
                T::VaultAssetId::get(),
                &Self::account_id(),
                to,
                amount,
                Preservation::Expendable,
            )
            .map_err(|_| Error::<T>::TransferFailed)?;
            Ok(())
        }

        /// Share supply, idle backing and fee caps.
        #[cfg(any(feature = "try-runtime", test))]
        pub fn do_try_state() -> Result<(), DispatchError> {
            let summed = ShareBalances::<T>::iter_values()
                .try_fold(0u128, |acc, shares| acc.checked_add(shares))
                .ok_or(DispatchError::Other("share balances overflow"))?;
            ensure!(
                summed == TotalShares::<T>::get(),
                DispatchError::Other("share balances do not sum to total shares")
            );

            let held = T::Assets::balance(T::VaultAssetId::get(), &Self::account_id());
            ensure!(
                IdleAssets::<T>::get() <= held,
                DispatchError::Other("idle counter exceeds custody balance")
            );

            ensure!(
                WithdrawalFeeBps::<T>::get() <= MAX_WITHDRAWAL_FEE_BPS
                    && PerformanceFeeBps::<T>::get() <= MAX_PERFORMANCE_FEE_BPS,
                DispatchError::Other("fee above cap")
            );

            Ok(())
        }
    }
}

// =============================================================================
//                         VaultCustody Implementation
// =============================================================================

impl<T: Config> VaultCustody<T::AccountId, T::Balance> for Pallet<T> {
    fn custody_account() -> T::AccountId {
        Self::account_id()
    }

    fn on_capital_returned(amount: T::Balance) -> DispatchResult {
        Self::credit_idle(amount)
    }

    fn on_profit_realized(profit: T::Balance) -> Result<T::Balance, DispatchError> {
        let performance_fee: T::Balance = match FeeRecipient::<T>::get() {
            Some(recipient) => {
                let fee: T::Balance = bps_of(profit.into(), PerformanceFeeBps::<T>::get())?.into();
                if !fee.is_zero() {
                    T::Assets::transfer(
                        T::VaultAssetId::get(),
                        &Self::account_id(),
                        &recipient,
                        fee,
                        Preservation::Expendable,
                    )
                    .map_err(|_| Error::<T>::TransferFailed)?;
                }
                fee
            }
            None => Zero::zero(),
        };

        let credited: u128 = profit.into();
        let credited = credited.saturating_sub(performance_fee.into());
        Self::credit_idle(credited.into())?;

        log::info!(
            target: LOG_TARGET,
            "📈 Profit {:?} realized, performance fee {:?}",
            profit,
            performance_fee
        );

        Self::deposit_event(Event::ProfitRealized { profit, performance_fee });

        Ok(performance_fee)
    }

    fn guarded<R, F>(f: F) -> Result<R, DispatchError>
    where
        F: FnOnce() -> Result<R, DispatchError>,
    {
        pallet::Pallet::<T>::guarded(f)
    }
}
