//! Test runtime for the allocator pallet.

use crate as pallet_vault_allocator;
use crate::{HoldingYieldSource, YieldSource};
use core::cell::RefCell;
use frame_support::{
    derive_impl, ord_parameter_types, parameter_types,
    traits::{
        fungibles::{Inspect, Mutate},
        tokens::Preservation,
        AsEnsureOriginWithArg, ConstU128, ConstU32, ConstU64, EitherOfDiverse,
    },
    PalletId,
};
use frame_system::{EnsureRoot, EnsureSigned, EnsureSignedBy};
use sp_runtime::{BuildStorage, DispatchError, DispatchResult};
use std::collections::BTreeMap;
use vault_primitives::{BasisPoints, VaultCustody};

type Block = frame_system::mocking::MockBlock<Test>;

pub type AccountId = u64;
pub type Balance = u128;
pub type AssetId = u32;

pub const VAULT_ASSET: AssetId = 1;
pub const OTHER_ASSET: AssetId = 2;

pub const ALICE: AccountId = 1;
pub const STRATEGIST: AccountId = 10;
pub const GUARDIAN: AccountId = 11;
pub const STRAT_A: AccountId = 100;
pub const STRAT_B: AccountId = 101;
pub const STRAT_C: AccountId = 102;
pub const VAULT_ACCOUNT: AccountId = 500;
pub const LOSS_SINK: AccountId = 999;

/// Errors raised by the fault-injecting yield source. Unit variants survive
/// the event round trip through storage.
pub const WITHDRAW_REVERTED: DispatchError = DispatchError::Unavailable;
pub const HARVEST_REVERTED: DispatchError = DispatchError::Exhausted;
pub const EMERGENCY_REVERTED: DispatchError = DispatchError::Corruption;

/// Returned by the mock vault when its lock is already held.
pub const VAULT_LOCKED: DispatchError = DispatchError::Other("vault locked");

pub const VAULT_FUNDS: Balance = 10_000;
pub const GENESIS_MS: u64 = 1_700_000_000_000;

frame_support::construct_runtime!(
    pub enum Test {
        System: frame_system,
        Timestamp: pallet_timestamp,
        Balances: pallet_balances,
        Assets: pallet_assets,
        Allocator: pallet_vault_allocator,
    }
);

#[derive_impl(frame_system::config_preludes::TestDefaultConfig)]
impl frame_system::Config for Test {
    type Block = Block;
    type AccountData = pallet_balances::AccountData<Balance>;
}

impl pallet_timestamp::Config for Test {
    type Moment = u64;
    type OnTimestampSet = ();
    type MinimumPeriod = ConstU64<1>;
    type WeightInfo = ();
}

impl pallet_balances::Config for Test {
    type MaxLocks = ConstU32<50>;
    type MaxReserves = ConstU32<50>;
    type ReserveIdentifier = [u8; 8];
    type Balance = Balance;
    type RuntimeEvent = RuntimeEvent;
    type DustRemoval = ();
    type ExistentialDeposit = ConstU128<1>;
    type AccountStore = System;
    type WeightInfo = ();
    type FreezeIdentifier = ();
    type MaxFreezes = ConstU32<0>;
    type RuntimeHoldReason = ();
    type RuntimeFreezeReason = ();
    type DoneSlashHandler = ();
}

impl pallet_assets::Config for Test {
    type RuntimeEvent = RuntimeEvent;
    type Balance = Balance;
    type AssetId = AssetId;
    type AssetIdParameter = codec::Compact<AssetId>;
    type Currency = Balances;
    type CreateOrigin = AsEnsureOriginWithArg<EnsureSigned<AccountId>>;
    type ForceOrigin = EnsureRoot<AccountId>;
    type AssetDeposit = ConstU128<1>;
    type AssetAccountDeposit = ConstU128<1>;
    type MetadataDepositBase = ConstU128<1>;
    type MetadataDepositPerByte = ConstU128<1>;
    type ApprovalDeposit = ConstU128<1>;
    type StringLimit = ConstU32<50>;
    type Freezer = ();
    type Extra = ();
    type WeightInfo = ();
    type Holder = ();
    type CallbackHandle = ();
    type RemoveItemsLimit = ConstU32<1000>;
}

parameter_types! {
    pub const VaultAssetId: AssetId = VAULT_ASSET;
    pub const AllocatorPalletId: PalletId = PalletId(*b"vltalloc");
    pub const MaxStrategies: u32 = 10;
    pub storage VaultIdle: Balance = 0;
    pub storage VaultProfit: Balance = 0;
    pub storage VaultLocked: bool = false;
}

ord_parameter_types! {
    pub const Strategist: AccountId = STRATEGIST;
    pub const Guardian: AccountId = GUARDIAN;
}

impl pallet_vault_allocator::Config for Test {
    type RuntimeEvent = RuntimeEvent;
    type Balance = Balance;
    type AssetId = AssetId;
    type Assets = Assets;
    type VaultAssetId = VaultAssetId;
    type YieldSource = MockYieldSource;
    type Vault = MockVault;
    type StrategistOrigin = EitherOfDiverse<EnsureRoot<AccountId>, EnsureSignedBy<Strategist, AccountId>>;
    type GuardianOrigin = EitherOfDiverse<EnsureRoot<AccountId>, EnsureSignedBy<Guardian, AccountId>>;
    type PalletId = AllocatorPalletId;
    type MaxStrategies = MaxStrategies;
}

// =============================================================================
//                              Mock Vault
// =============================================================================

/// Stand-in for the ledger: tallies the idle credit and realized profit and
/// owns the lock.
pub struct MockVault;

impl VaultCustody<AccountId, Balance> for MockVault {
    fn custody_account() -> AccountId {
        VAULT_ACCOUNT
    }

    fn on_capital_returned(amount: Balance) -> DispatchResult {
        VaultIdle::set(&(VaultIdle::get() + amount));
        Ok(())
    }

    fn on_profit_realized(profit: Balance) -> Result<Balance, DispatchError> {
        VaultProfit::set(&(VaultProfit::get() + profit));
        Ok(0)
    }

    fn guarded<R, F>(f: F) -> Result<R, DispatchError>
    where
        F: FnOnce() -> Result<R, DispatchError>,
    {
        if VaultLocked::get() {
            return Err(VAULT_LOCKED);
        }
        VaultLocked::set(&true);
        let result = f();
        VaultLocked::set(&false);
        result
    }
}

// =============================================================================
//                           Mock Yield Source
// =============================================================================

/// Misbehaviour injected into a single strategy.
#[derive(Clone, Default)]
pub struct Faults {
    pub asset: Option<AssetId>,
    pub inactive: bool,
    /// Maximum a single withdrawal releases
    pub liquidity_cap: Option<Balance>,
    /// Withdrawal moves one unit, then reverts
    pub fail_withdraw: bool,
    pub fail_emergency: bool,
    pub fail_harvest: bool,
    /// Minted to the recipient on harvest
    pub reward: Balance,
    /// Burned from the strategy on harvest
    pub harvest_loss: Balance,
    pub yield_rate: BasisPoints,
    /// Reported instead of the strategy balance
    pub estimate: Option<Balance>,
    /// Deposit hook calls back into `rebalance`
    pub reenter_on_deposit: bool,
}

thread_local! {
    static FAULTS: RefCell<BTreeMap<AccountId, Faults>> = RefCell::new(BTreeMap::new());
    static REENTRY: RefCell<Option<DispatchResult>> = RefCell::new(None);
}

pub fn set_faults(strategy: AccountId, f: impl FnOnce(&mut Faults)) {
    FAULTS.with(|faults| f(faults.borrow_mut().entry(strategy).or_default()));
}

fn faults(strategy: &AccountId) -> Faults {
    FAULTS.with(|faults| faults.borrow().get(strategy).cloned().unwrap_or_default())
}

/// Outcome of the last re-entrant call attempted by a strategy hook.
pub fn last_reentry() -> Option<DispatchResult> {
    REENTRY.with(|r| r.borrow().clone())
}

type Holding = HoldingYieldSource<Test>;

/// Holding strategy with fault injection.
pub struct MockYieldSource;

impl YieldSource for MockYieldSource {
    type AccountId = AccountId;
    type AssetId = AssetId;
    type Balance = Balance;

    fn accepted_asset(strategy: &AccountId) -> AssetId {
        faults(strategy).asset.unwrap_or(VAULT_ASSET)
    }

    fn deposit(strategy: &AccountId) -> DispatchResult {
        if faults(strategy).reenter_on_deposit {
            let outcome = Allocator::rebalance(RuntimeOrigin::root());
            REENTRY.with(|r| *r.borrow_mut() = Some(outcome));
        }
        Holding::deposit(strategy)
    }

    fn withdraw(
        strategy: &AccountId,
        amount: Balance,
        recipient: &AccountId,
    ) -> Result<Balance, DispatchError> {
        let f = faults(strategy);
        if f.fail_withdraw {
            Holding::withdraw(strategy, 1, recipient)?;
            return Err(WITHDRAW_REVERTED);
        }
        let capped = f.liquidity_cap.map_or(amount, |cap| amount.min(cap));
        Holding::withdraw(strategy, capped, recipient)
    }

    fn withdraw_all(strategy: &AccountId, recipient: &AccountId) -> Result<Balance, DispatchError> {
        Self::withdraw(strategy, Holding::estimated_total_assets(strategy), recipient)
    }

    fn harvest(strategy: &AccountId, recipient: &AccountId) -> DispatchResult {
        let f = faults(strategy);
        if f.fail_harvest {
            return Err(HARVEST_REVERTED);
        }
        if f.reward > 0 {
            <Assets as Mutate<AccountId>>::mint_into(VAULT_ASSET, recipient, f.reward)?;
        }
        if f.harvest_loss > 0 {
            <Assets as Mutate<AccountId>>::transfer(
                VAULT_ASSET,
                strategy,
                &LOSS_SINK,
                f.harvest_loss,
                Preservation::Expendable,
            )?;
        }
        Ok(())
    }

    fn estimated_total_assets(strategy: &AccountId) -> Balance {
        faults(strategy)
            .estimate
            .unwrap_or_else(|| Holding::estimated_total_assets(strategy))
    }

    fn current_yield_rate(strategy: &AccountId) -> BasisPoints {
        faults(strategy).yield_rate
    }

    fn emergency_withdraw(strategy: &AccountId, recipient: &AccountId) -> DispatchResult {
        if faults(strategy).fail_emergency {
            return Err(EMERGENCY_REVERTED);
        }
        Holding::emergency_withdraw(strategy, recipient)
    }

    fn is_active(strategy: &AccountId) -> bool {
        !faults(strategy).inactive
    }
}

// =============================================================================
//                               Helpers
// =============================================================================

pub fn asset_balance(who: AccountId) -> Balance {
    <Assets as Inspect<AccountId>>::balance(VAULT_ASSET, &who)
}

pub fn new_test_ext() -> sp_io::TestExternalities {
    FAULTS.with(|faults| faults.borrow_mut().clear());
    REENTRY.with(|r| *r.borrow_mut() = None);

    let mut t = frame_system::GenesisConfig::<Test>::default()
        .build_storage()
        .unwrap();

    pallet_balances::GenesisConfig::<Test> {
        balances: vec![(ALICE, 1_000)],
        ..Default::default()
    }
    .assimilate_storage(&mut t)
    .unwrap();

    pallet_assets::GenesisConfig::<Test> {
        assets: vec![(VAULT_ASSET, ALICE, true, 1), (OTHER_ASSET, ALICE, true, 1)],
        accounts: vec![(VAULT_ASSET, VAULT_ACCOUNT, VAULT_FUNDS)],
        ..Default::default()
    }
    .assimilate_storage(&mut t)
    .unwrap();

    let mut ext = sp_io::TestExternalities::new(t);
    ext.execute_with(|| {
        System::set_block_number(1);
        Timestamp::set_timestamp(GENESIS_MS);
    });
    ext
}
