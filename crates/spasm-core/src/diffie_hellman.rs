//! Ring Diffie-Hellman over a fixed prime group
//!
//! N parties each hold a private exponent. Every party starts from its
//! own public key `g^a mod p`; in each of N - 1 rounds it raises the key
//! received from its ring predecessor to its own exponent. After the last
//! round all parties hold `g^(a1 * ... * aN) mod p`, which is hashed into
//! a [`SharedSecret`].

use std::fmt;
use std::sync::OnceLock;

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use tiny_keccak::{Hasher, Sha3};

use crate::{Error, Result};

/// Output width of SHA3-384 in bytes
pub const DIGEST_SIZE: usize = 48;

const GENERATOR: u32 = 4;

// 4096-bit prime modulus
const MODP_4096: &str = concat!(
    "8625008567454263731149051629354734021376250408035234067995553647",
    "7276924603329294685388757846442174733079880613151251848005050489",
    "3357640514819520008444284556127041593924110354910763041900773281",
    "2234678753943928555326727476407777692806930682490123455408235791",
    "0325433576079502761137761898882608735831288317419876044456082004",
    "1925044811524498487018283184311853786255067619308136974035910760",
    "2342975995694354646786381429545018670160443950802600548239557714",
    "9984975848246070235071382878421046137824147871402595999595439623",
    "2840322224435876656171282718011485549295407254100505479379605684",
    "9205535040978632563949671795271186639731750608423449680084378666",
    "6493434332338369006212332628549801558309318755836477236262662750",
    "1100148898374549760841234079491164193149205302703762803481685117",
    "0231457178240022472913741247507628409618497082523950740888362543",
    "0183193808556766396651064319478621478086240654431905731788525005",
    "8713333255529656022074998988267540105515386811757060615910180688",
    "5237284867412790611519194499785167618441872390133932291871821599",
    "4775668526736129118106399401168921163031304627362711462342129290",
    "5195402496538142692725713072606938108366022507229123664302120960",
    "9358084088295937174968621450563346706818783587096802176795387598",
    "12378931657901887",
);

// 2048-bit prime modulus
const MODP_2048: &str = concat!(
    "2598938964192127664710851015128007967879777914483619667873852589",
    "5929416263022550876704444832025837795493964669333377930118523898",
    "2066569550589832039994983425960832158778778385593335987872475309",
    "5942032768367238064638168359747116065747147487412413522079252785",
    "0205849454190229036918761851880597052625959860408785453007734034",
    "9231117796932391735613483223759015286998265777589246525863477738",
    "5411571139967753379344122029176862355689731329390486266124604553",
    "6938603957615661811385514189118178632617389286336457140859571461",
    "2026191839782693513970094901267975441157235425858599190899986377",
    "96439828191759310660031783405445032995787",
);

/// Multiplicative group parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    modulus: BigUint,
    generator: BigUint,
    bits: u64,
    byte_len: usize,
}

impl Group {
    pub fn new(modulus: BigUint, generator: BigUint) -> Result<Self> {
        if modulus <= BigUint::from(3u32) {
            return Err(Error::key_exchange("Modulus is too small."));
        }
        if generator <= BigUint::one() || generator >= modulus {
            return Err(Error::key_exchange("Generator must lie in (1, modulus)."));
        }
        let bits = modulus.bits();
        Ok(Self {
            byte_len: ((bits + 7) / 8) as usize,
            bits,
            modulus,
            generator,
        })
    }

    /// Default 4096-bit group with generator 4
    pub fn modp4096() -> &'static Group {
        static GROUP: OnceLock<Group> = OnceLock::new();
        GROUP.get_or_init(|| Self::from_decimal(MODP_4096))
    }

    /// Faster 2048-bit group with generator 4
    pub fn modp2048() -> &'static Group {
        static GROUP: OnceLock<Group> = OnceLock::new();
        GROUP.get_or_init(|| Self::from_decimal(MODP_2048))
    }

    fn from_decimal(digits: &str) -> Group {
        let modulus = BigUint::parse_bytes(digits.as_bytes(), 10).expect("modulus literal is decimal");
        Self::new(modulus, BigUint::from(GENERATOR)).expect("builtin group parameters are valid")
    }

    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// Width of a serialized group element
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Encode a group element for a KEY_EXCHANGE_STEP payload
    pub fn key_to_hex(&self, key: &BigUint) -> String {
        key.to_str_radix(16)
    }

    /// Decode a KEY_EXCHANGE_STEP payload into a group element
    pub fn key_from_hex(&self, hex_key: &str) -> Result<BigUint> {
        let key = BigUint::parse_bytes(hex_key.as_bytes(), 16)
            .ok_or_else(|| Error::key_exchange("Intermediate key is not hexadecimal."))?;
        if key.is_zero() || key >= self.modulus {
            return Err(Error::key_exchange("Intermediate key is outside the group."));
        }
        Ok(key)
    }

    fn encode(&self, key: &BigUint) -> Vec<u8> {
        let mut bytes = key.to_bytes_le();
        bytes.resize(self.byte_len, 0);
        bytes
    }
}

/// One party's state in the ring exchange.
///
/// Created with the generator already transformed, so the public key is
/// available immediately and exactly N - 1 further transforms are legal.
pub struct DiffieHellmanState {
    group: Group,
    n: usize,
    step: usize,
    private_key: BigUint,
    latest_key: BigUint,
}

impl DiffieHellmanState {
    /// State for a ring of `n` parties in the default group
    pub fn new(n: usize) -> Result<Self> {
        Self::with_group(n, Group::modp4096())
    }

    pub fn with_group(n: usize, group: &Group) -> Result<Self> {
        if n == 0 {
            return Err(Error::key_exchange("A ring needs at least one party."));
        }
        let private_key = rand::thread_rng().gen_biguint(group.bits);
        let mut state = Self {
            group: group.clone(),
            n,
            step: 0,
            private_key,
            latest_key: BigUint::zero(),
        };
        let generator = state.group.generator.clone();
        state.transform(&generator)?;
        Ok(state)
    }

    /// Raise `key` to the private exponent and keep it as the latest key
    pub fn transform(&mut self, key: &BigUint) -> Result<&BigUint> {
        if self.step >= self.n {
            return Err(Error::key_exchange(format!(
                "Tried performing more than N - 1 ({}) steps.",
                self.n - 1
            )));
        }
        self.latest_key = key.modpow(&self.private_key, &self.group.modulus);
        self.step += 1;
        Ok(&self.latest_key)
    }

    /// The key to pass to the ring successor
    pub fn public_key(&self) -> Result<&BigUint> {
        if self.step >= self.n {
            return Err(Error::key_exchange(
                "Tried accessing final key as public. Use result() instead.",
            ));
        }
        Ok(&self.latest_key)
    }

    /// The shared secret, once all N - 1 rounds are done
    pub fn result(&self) -> Option<SharedSecret> {
        if self.step != self.n {
            return None;
        }
        let digest = sha3_384(&[&self.group.encode(&self.latest_key)]);
        Some(SharedSecret { bytes: digest })
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn parties(&self) -> usize {
        self.n
    }

    /// Completed transforms, including the initial one
    pub fn step(&self) -> usize {
        self.step
    }
}

impl fmt::Debug for DiffieHellmanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiffieHellmanState")
            .field("n", &self.n)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

/// Hashed group secret, used as the pseudonymization salt
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret {
    bytes: [u8; DIGEST_SIZE],
}

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.bytes
    }

    /// Digest every ring member reports so the coordinator can compare
    /// secrets without learning them
    pub fn proof(&self) -> String {
        hex::encode(sha3_384(&[&self.bytes]))
    }

    /// Keyed hasher labelling ids under this secret
    pub fn pseudonymizer(&self) -> Pseudonymizer {
        let mut base = Sha3::v384();
        base.update(&self.bytes);
        Pseudonymizer { base }
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret(proof={})", self.proof())
    }
}

/// SHA3-384 state seeded with a salt; cloned per labelled id
#[derive(Clone)]
pub struct Pseudonymizer {
    base: Sha3,
}

impl Pseudonymizer {
    /// Lowercase hex of `SHA3-384(salt || id)`
    pub fn label(&self, id: &str) -> String {
        let mut hasher = self.base.clone();
        hasher.update(id.as_bytes());
        let mut out = [0u8; DIGEST_SIZE];
        hasher.finalize(&mut out);
        hex::encode(out)
    }
}

/// SHA3-384 over the concatenation of `parts`
pub fn sha3_384(parts: &[&[u8]]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha3::v384();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; DIGEST_SIZE];
    hasher.finalize(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_group() -> Group {
        // 1019 = 2 * 509 + 1
        Group::new(BigUint::from(1019u32), BigUint::from(4u32)).unwrap()
    }

    /// Drive a full ring the way custodians do: each round every party
    /// transforms the key held by its predecessor.
    fn run_ring(parties: &mut [DiffieHellmanState]) {
        let n = parties.len();
        for _ in 0..n - 1 {
            let keys: Vec<BigUint> = parties
                .iter()
                .map(|p| p.public_key().unwrap().clone())
                .collect();
            for (i, party) in parties.iter_mut().enumerate() {
                let prev = (i + n - 1) % n;
                party.transform(&keys[prev]).unwrap();
            }
        }
    }

    #[test]
    fn test_single_party_is_complete_immediately() {
        let state = DiffieHellmanState::with_group(1, &small_group()).unwrap();
        assert!(state.result().is_some());
        assert!(state.public_key().is_err());
    }

    #[test]
    fn test_ring_agrees() {
        let group = small_group();
        for n in [2usize, 3, 5] {
            let mut parties: Vec<_> = (0..n)
                .map(|_| DiffieHellmanState::with_group(n, &group).unwrap())
                .collect();
            assert!(parties.iter().all(|p| p.result().is_none()));
            run_ring(&mut parties);
            let first = parties[0].result().unwrap();
            for party in &parties {
                assert_eq!(party.result().unwrap(), first);
                assert_eq!(party.result().unwrap().proof(), first.proof());
            }
        }
    }

    #[test]
    fn test_secret_is_hash_of_group_power() {
        let group = Group::modp2048().clone();
        for n in [1usize, 2, 5] {
            let mut parties: Vec<_> = (0..n)
                .map(|_| DiffieHellmanState::with_group(n, &group).unwrap())
                .collect();
            run_ring(&mut parties);

            let exponent = parties
                .iter()
                .fold(BigUint::one(), |acc, p| acc * &p.private_key);
            let expected = group.generator().modpow(&exponent, group.modulus());
            let digest = sha3_384(&[&group.encode(&expected)]);
            for (i, party) in parties.iter().enumerate() {
                let secret = party.result().unwrap();
                assert_eq!(secret.as_bytes(), &digest, "party {} of {}", i, n);
            }
        }
    }

    #[test]
    fn test_too_many_transforms_rejected() {
        let group = small_group();
        let mut state = DiffieHellmanState::with_group(2, &group).unwrap();
        let key = BigUint::from(16u32);
        state.transform(&key).unwrap();
        assert_eq!(state.step(), 2);
        assert!(matches!(state.transform(&key), Err(Error::KeyExchange(_))));
        assert!(matches!(state.public_key(), Err(Error::KeyExchange(_))));
    }

    #[test]
    fn test_zero_parties_rejected() {
        assert!(DiffieHellmanState::with_group(0, &small_group()).is_err());
    }

    #[test]
    fn test_builtin_groups() {
        assert_eq!(Group::modp4096().modulus().bits(), 4096);
        assert_eq!(Group::modp4096().byte_len(), 512);
        assert_eq!(Group::modp2048().modulus().bits(), 2048);
        assert_eq!(Group::modp2048().generator(), &BigUint::from(4u32));
    }

    #[test]
    fn test_key_hex_roundtrip_and_bounds() {
        let group = small_group();
        let key = BigUint::from(1000u32);
        let hex_key = group.key_to_hex(&key);
        assert_eq!(group.key_from_hex(&hex_key).unwrap(), key);
        assert!(group.key_from_hex("zz").is_err());
        assert!(group.key_from_hex(&group.key_to_hex(&BigUint::from(1019u32))).is_err());
        assert!(group.key_from_hex("0").is_err());
    }

    #[test]
    fn test_pseudonymizer_labels() {
        let secret = SharedSecret::from_bytes([7u8; DIGEST_SIZE]);
        let labeller = secret.pseudonymizer();
        let label = labeller.label("patient-1");
        assert_eq!(label.len(), DIGEST_SIZE * 2);
        assert_eq!(label, labeller.label("patient-1"));
        assert_ne!(label, labeller.label("patient-2"));
        assert_eq!(label, hex::encode(sha3_384(&[&[7u8; DIGEST_SIZE], b"patient-1"])));

        let other = SharedSecret::from_bytes([8u8; DIGEST_SIZE]).pseudonymizer();
        assert_ne!(label, other.label("patient-1"));
    }
}
