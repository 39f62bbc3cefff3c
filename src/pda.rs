// DANS : src/pda.rs

use solana_sdk::pubkey::Pubkey;

/// Le programme mpl-core : les comptes d'assets auxquels on s'abonne lui appartiennent.
pub const CORE_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("CoREENxT6tW1HoK8ypY1SxRMZTcVPm7R94rH4PZNhX7d");

/// Le programme floor-swap : propriétaire du compte de pool dérivé.
pub const FLOOR_SWAP_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("FSWAP98yr51moUvni9iv32ptFY43KEPBBkNk28tZunr7");

const POOL_PREFIX: &[u8] = b"floor_swap";

/// Dérive l'adresse de la pool depuis l'autorité et la collection.
/// Seeds : ["floor_swap", authority, collection].
pub fn find_pool_pda(authority: &Pubkey, collection: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(
        &[POOL_PREFIX, authority.as_ref(), collection.as_ref()],
        &FLOOR_SWAP_PROGRAM_ID,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_stable() {
        let authority = Pubkey::new_unique();
        let collection = Pubkey::new_unique();

        let (pool_a, bump_a) = find_pool_pda(&authority, &collection);
        let (pool_b, bump_b) = find_pool_pda(&authority, &collection);
        assert_eq!(pool_a, pool_b);
        assert_eq!(bump_a, bump_b);

        // Une autre collection donne une autre pool.
        let other = Pubkey::new_unique();
        let (pool_c, _) = find_pool_pda(&authority, &other);
        assert_ne!(pool_a, pool_c);
    }
}
