// DANS : src/decoders/mpl_core.rs

use anyhow::{anyhow, bail, Result};
use solana_sdk::pubkey::Pubkey;

// Layout du préfixe d'un compte AssetV1 mpl-core :
//   [0]      key (1 = AssetV1)
//   [1..33]  owner
//   [33]     tag de l'update authority (0 = None, 1 = Address, 2 = Collection)
//   [34..66] adresse de la collection (si tag == 2)
// Le reste (name, uri, plugins) ne nous intéresse pas ici : le
// relai récupère l'enregistrement complet via l'index DAS.

const ASSET_V1_KEY: u8 = 1;
const UPDATE_AUTHORITY_COLLECTION: u8 = 2;

/// Offset memcmp de l'adresse de collection dans un compte AssetV1 (1 + 32 + 1).
/// C'est sur cet offset que le filtre d'abonnement est construit.
pub const COLLECTION_MEMCMP_OFFSET: usize = 34;

/// Les champs du compte AssetV1 dont la réconciliation a besoin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetHeader {
    pub owner: Pubkey,
    /// La collection, uniquement si l'update authority est de type Collection.
    pub collection: Option<Pubkey>,
}

/// Décode le préfixe d'un compte AssetV1. Un échec ici est une erreur
/// récupérable : l'appelant ignore la notification fautive, il ne
/// redémarre pas le flux.
pub fn decode_asset_header(data: &[u8]) -> Result<AssetHeader> {
    if data.len() < COLLECTION_MEMCMP_OFFSET {
        bail!("compte trop court pour un AssetV1 ({} octets)", data.len());
    }
    if data[0] != ASSET_V1_KEY {
        bail!("discriminant inattendu : {} (attendu AssetV1)", data[0]);
    }

    let owner = Pubkey::try_from(&data[1..33])
        .map_err(|_| anyhow!("owner illisible dans le compte AssetV1"))?;

    let collection = if data[33] == UPDATE_AUTHORITY_COLLECTION {
        if data.len() < 66 {
            bail!("compte tronqué : tag Collection sans adresse");
        }
        Some(
            Pubkey::try_from(&data[34..66])
                .map_err(|_| anyhow!("collection illisible dans le compte AssetV1"))?,
        )
    } else {
        None
    };

    Ok(AssetHeader { owner, collection })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset_bytes(owner: &Pubkey, collection: Option<&Pubkey>) -> Vec<u8> {
        let mut data = vec![ASSET_V1_KEY];
        data.extend_from_slice(owner.as_ref());
        match collection {
            Some(c) => {
                data.push(UPDATE_AUTHORITY_COLLECTION);
                data.extend_from_slice(c.as_ref());
            }
            None => data.push(0),
        }
        data
    }

    #[test]
    fn decode_asset_avec_collection() {
        let owner = Pubkey::new_unique();
        let collection = Pubkey::new_unique();
        let data = asset_bytes(&owner, Some(&collection));

        let header = decode_asset_header(&data).unwrap();
        assert_eq!(header.owner, owner);
        assert_eq!(header.collection, Some(collection));

        // L'offset memcmp pointe bien sur l'adresse de la collection.
        assert_eq!(
            &data[COLLECTION_MEMCMP_OFFSET..COLLECTION_MEMCMP_OFFSET + 32],
            collection.as_ref()
        );
    }

    #[test]
    fn decode_asset_sans_collection() {
        let owner = Pubkey::new_unique();
        let header = decode_asset_header(&asset_bytes(&owner, None)).unwrap();
        assert_eq!(header.collection, None);
    }

    #[test]
    fn decode_rejette_les_comptes_invalides() {
        assert!(decode_asset_header(&[]).is_err());
        assert!(decode_asset_header(&[7; 66]).is_err()); // mauvais discriminant

        let mut tronque = vec![ASSET_V1_KEY];
        tronque.extend_from_slice(Pubkey::new_unique().as_ref());
        tronque.push(UPDATE_AUTHORITY_COLLECTION); // tag Collection mais pas d'adresse
        assert!(decode_asset_header(&tronque).is_err());
    }
}
