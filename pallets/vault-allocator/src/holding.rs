use core::marker::PhantomData;

use frame_support::traits::fungibles::{Inspect, Mutate};
use frame_support::traits::tokens::Preservation;
use frame_support::traits::Get;
use sp_runtime::traits::Zero;
use sp_runtime::{DispatchError, DispatchResult};
use vault_primitives::BasisPoints;

use crate::{Config, YieldSource, LOG_TARGET};

/// Yield source that simply holds the vault asset in the strategy account.
///
/// Produces no yield. Useful as a parking slot for capital and as the base
/// for test doubles.
pub struct HoldingYieldSource<T>(PhantomData<T>);

impl<T: Config> YieldSource for HoldingYieldSource<T> {
    type AccountId = T::AccountId;
    type AssetId = T::AssetId;
    type Balance = T::Balance;

    fn accepted_asset(_strategy: &T::AccountId) -> T::AssetId {
        T::VaultAssetId::get()
    }

    fn deposit(strategy: &T::AccountId) -> DispatchResult {
        log::debug!(
            target: LOG_TARGET,
            "Holding strategy {:?} now holds {:?}",
            strategy,
            Self::estimated_total_assets(strategy)
        );
        Ok(())
    }

    fn withdraw(
        strategy: &T::AccountId,
        amount: T::Balance,
        recipient: &T::AccountId,
    ) -> Result<T::Balance, DispatchError> {
        let released = amount.min(Self::estimated_total_assets(strategy));
        if released.is_zero() {
            return Ok(released);
        }
        T::Assets::transfer(
            T::VaultAssetId::get(),
            strategy,
            recipient,
            released,
            Preservation::Expendable,
        )
    }

    fn withdraw_all(
        strategy: &T::AccountId,
        recipient: &T::AccountId,
    ) -> Result<T::Balance, DispatchError> {
        Self::withdraw(strategy, Self::estimated_total_assets(strategy), recipient)
    }

    fn harvest(_strategy: &T::AccountId, _recipient: &T::AccountId) -> DispatchResult {
        Ok(())
    }

    fn estimated_total_assets(strategy: &T::AccountId) -> T::Balance {
        T::Assets::balance(T::VaultAssetId::get(), strategy)
    }

    fn current_yield_rate(_strategy: &T::AccountId) -> BasisPoints {
        0
    }

    fn emergency_withdraw(strategy: &T::AccountId, recipient: &T::AccountId) -> DispatchResult {
        Self::withdraw_all(strategy, recipient).map(|_| ())
    }

    fn is_active(_strategy: &T::AccountId) -> bool {
        true
    }
}
