//! Test runtime wiring the ledger to the real allocator.

use crate as pallet_vault_ledger;
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
use pallet_vault_allocator::{HoldingYieldSource, YieldSource};
use sp_runtime::{BuildStorage, DispatchError, DispatchResult};
use std::collections::BTreeMap;
use vault_primitives::BasisPoints;

type Block = frame_system::mocking::MockBlock<Test>;

pub type AccountId = u64;
pub type Balance = u128;
pub type AssetId = u32;

pub const VAULT_ASSET: AssetId = 1;

pub const ALICE: AccountId = 1;
pub const BOB: AccountId = 2;
pub const CHARLIE: AccountId = 3;
pub const FEE_DEST: AccountId = 4;
pub const STRATEGIST: AccountId = 10;
pub const GUARDIAN: AccountId = 11;
pub const ADMIN: AccountId = 12;
pub const STRAT_A: AccountId = 100;
pub const STRAT_B: AccountId = 101;
pub const LOSS_SINK: AccountId = 999;

/// Errors raised by the fault-injecting yield source. Unit variants survive
/// the event round trip through storage.
pub const WITHDRAW_REVERTED: DispatchError = DispatchError::Unavailable;
pub const HARVEST_REVERTED: DispatchError = DispatchError::Exhausted;
pub const EMERGENCY_REVERTED: DispatchError = DispatchError::Corruption;

pub const INITIAL_FUNDS: Balance = 1_000_000;

frame_support::construct_runtime!(
    pub enum Test {
        System: frame_system,
        Timestamp: pallet_timestamp,
        Balances: pallet_balances,
        Assets: pallet_assets,
        Allocator: pallet_vault_allocator,
        Ledger: pallet_vault_ledger,
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
    pub const LedgerPalletId: PalletId = PalletId(*b"vltledgr");
    pub const MaxStrategies: u32 = 10;
}

ord_parameter_types! {
    pub const Strategist: AccountId = STRATEGIST;
    pub const Guardian: AccountId = GUARDIAN;
    pub const Admin: AccountId = ADMIN;
}

impl pallet_vault_allocator::Config for Test {
    type RuntimeEvent = RuntimeEvent;
    type Balance = Balance;
    type AssetId = AssetId;
    type Assets = Assets;
    type VaultAssetId = VaultAssetId;
    type YieldSource = MockYieldSource;
    type Vault = Ledger;
    type StrategistOrigin = EitherOfDiverse<EnsureRoot<AccountId>, EnsureSignedBy<Strategist, AccountId>>;
    type GuardianOrigin = EitherOfDiverse<EnsureRoot<AccountId>, EnsureSignedBy<Guardian, AccountId>>;
    type PalletId = AllocatorPalletId;
    type MaxStrategies = MaxStrategies;
}

impl pallet_vault_ledger::Config for Test {
    type RuntimeEvent = RuntimeEvent;
    type Balance = Balance;
    type AssetId = AssetId;
    type Assets = Assets;
    type VaultAssetId = VaultAssetId;
    type StrategyManager = Allocator;
    type AdminOrigin = EitherOfDiverse<EnsureRoot<AccountId>, EnsureSignedBy<Admin, AccountId>>;
    type GuardianOrigin = EitherOfDiverse<EnsureRoot<AccountId>, EnsureSignedBy<Guardian, AccountId>>;
    type PalletId = LedgerPalletId;
}

// =============================================================================
//                           Mock Yield Source
// =============================================================================

/// Misbehaviour injected into a single strategy.
#[derive(Clone, Default)]
pub struct Faults {
    /// Maximum a single withdrawal releases
    pub liquidity_cap: Option<Balance>,
    pub fail_withdraw: bool,
    pub fail_emergency: bool,
    /// Minted to the recipient on harvest
    pub reward: Balance,
    /// Burned from the strategy on harvest
    pub harvest_loss: Balance,
    /// Withdrawal hook tries to deposit into the ledger
    pub reenter_on_withdraw: bool,
    /// Harvest hook tries to deposit into the ledger
    pub reenter_on_harvest: bool,
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

pub fn last_reentry() -> Option<DispatchResult> {
    REENTRY.with(|r| r.borrow().clone())
}

fn reenter_ledger() {
    let outcome = Ledger::deposit(RuntimeOrigin::signed(CHARLIE), 10, CHARLIE);
    REENTRY.with(|r| *r.borrow_mut() = Some(outcome));
}

type Holding = HoldingYieldSource<Test>;

pub struct MockYieldSource;

impl YieldSource for MockYieldSource {
    type AccountId = AccountId;
    type AssetId = AssetId;
    type Balance = Balance;

    fn accepted_asset(strategy: &AccountId) -> AssetId {
        Holding::accepted_asset(strategy)
    }

    fn deposit(strategy: &AccountId) -> DispatchResult {
        Holding::deposit(strategy)
    }

    fn withdraw(
        strategy: &AccountId,
        amount: Balance,
        recipient: &AccountId,
    ) -> Result<Balance, DispatchError> {
        let f = faults(strategy);
        if f.reenter_on_withdraw {
            reenter_ledger();
        }
        if f.fail_withdraw {
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
        if f.reenter_on_harvest {
            reenter_ledger();
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
        Holding::estimated_total_assets(strategy)
    }

    fn current_yield_rate(_strategy: &AccountId) -> BasisPoints {
        0
    }

    fn emergency_withdraw(strategy: &AccountId, recipient: &AccountId) -> DispatchResult {
        if faults(strategy).fail_emergency {
            return Err(EMERGENCY_REVERTED);
        }
        Holding::emergency_withdraw(strategy, recipient)
    }

    fn is_active(_strategy: &AccountId) -> bool {
        true
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
        assets: vec![(VAULT_ASSET, ALICE, true, 1)],
        accounts: vec![
            (VAULT_ASSET, ALICE, INITIAL_FUNDS),
            (VAULT_ASSET, BOB, INITIAL_FUNDS),
            (VAULT_ASSET, CHARLIE, INITIAL_FUNDS),
        ],
        ..Default::default()
    }
    .assimilate_storage(&mut t)
    .unwrap();

    pallet_vault_ledger::GenesisConfig::<Test>::default()
        .assimilate_storage(&mut t)
        .unwrap();

    let mut ext = sp_io::TestExternalities::new(t);
    ext.execute_with(|| {
        System::set_block_number(1);
        Timestamp::set_timestamp(1_700_000_000_000);
    });
    ext
}
