//! Bounty transaction construction.
//!
//! Layout of a built transaction:
//!
//! ```text
//! output[0]        OP_RETURN <memo>, zero value
//! output[1..n-1]   one bounty payout per paid recipient, same amount each
//! output[n-1]      change to the sender
//! ```
//!
//! Inputs start with the funding UTXO, followed by the other UTXOs in order,
//! consumed only while they are needed to pay more recipients or the fee.

use bitcoin::{
    absolute::LockTime,
    consensus::encode::{deserialize, serialize},
    ecdsa,
    hashes::Hash,
    secp256k1,
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Amount, PublicKey, Script, ScriptBuf, Transaction, TxIn, TxOut,
};

use crate::chain::Signer;
use crate::config::{RelayConfig, SizeEstimates};
use crate::err_string;
use crate::error::{BuildError, Error};
use crate::script::memo_script;
use crate::types::{Recipient, Utxo};

/// Parses a user supplied fee. Only positive integers are accepted.
pub fn parse_fee(value: &str) -> Result<u64, BuildError> {
    match value.trim().parse::<u64>() {
        Ok(fee) if fee > 0 => Ok(fee),
        _ => Err(BuildError::InvalidFee(value.to_string())),
    }
}

/// Size of `tx` once every input carries a `<sig> <pubkey>` script_sig.
pub fn estimated_size(tx: &Transaction, sizes: &SizeEstimates) -> u64 {
    tx.base_size() as u64 + tx.input.len() as u64 * sizes.signature_bytes
}

/// An unsigned bounty transaction together with its accounting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BountyTx {
    pub tx: Transaction,
    /// Value of each bounty output.
    pub amount: u64,
    pub fee: u64,
    pub input_value: u64,
    /// Number of recipients paid, a prefix of the recipient list.
    pub paid: usize,
}

impl BountyTx {
    pub fn bounty_value(&self) -> u64 {
        self.amount * self.paid as u64
    }

    pub fn change(&self) -> u64 {
        self.input_value - self.bounty_value() - self.fee
    }

    pub fn bounty_outputs(&self) -> &[TxOut] {
        &self.tx.output[1..1 + self.paid]
    }

    /// Every bounty output must be worth at least what it costs to create and
    /// later spend it at this transaction's fee rate.
    pub fn is_viable(&self, sizes: &SizeEstimates) -> bool {
        let size = estimated_size(&self.tx, sizes);
        self.bounty_outputs().iter().all(|o| {
            o.value.to_sat() * size >= sizes.viable_output_size(o.script_pubkey.len()) * self.fee
        })
    }
}

/// Result of the bounty amount search: the smallest viable candidate for the
/// largest payable recipient count, or the boundary candidate when none is
/// viable.
#[derive(Clone, Debug)]
pub struct SearchOutcome {
    pub candidate: Result<BountyTx, BuildError>,
    pub viable: bool,
}

pub struct TxBuilder {
    memo: String,
    sizes: SizeEstimates,
}

impl TxBuilder {
    pub fn new(memo: impl Into<String>, sizes: SizeEstimates) -> Self {
        Self {
            memo: memo.into(),
            sizes,
        }
    }

    pub fn from_config(cfg: &RelayConfig) -> Self {
        Self::new(cfg.memo(), cfg.sizes)
    }

    pub fn memo(&self) -> &str {
        &self.memo
    }

    /// Builds the bounty transaction paying as many `recipients` as the funds
    /// allow, with the smallest viable bounty amount in `[1, fee]`.
    pub fn build(
        &self,
        funding: &Utxo,
        recipients: &[Recipient],
        others: &[Utxo],
        sender: &Script,
        fee: u64,
    ) -> Result<BountyTx, BuildError> {
        if fee == 0 {
            return Err(BuildError::InvalidFee(fee.to_string()));
        }
        let outcome = self.search(funding, recipients, others, sender, fee);
        let built = outcome.candidate?;
        if !outcome.viable {
            return Err(BuildError::NoValidBountyAmount { fee });
        }
        log::info!(
            "bounty tx pays {} of {} recipients {} each, fee {}, change {}",
            built.paid,
            recipients.len(),
            built.amount,
            fee,
            built.change()
        );
        Ok(built)
    }

    /// Tries payout counts from the most the funds can cover at amount 1 down
    /// to one, and binary searches the amount for each count.
    pub fn search(
        &self,
        funding: &Utxo,
        recipients: &[Recipient],
        others: &[Utxo],
        sender: &Script,
        fee: u64,
    ) -> SearchOutcome {
        let most = match self.assemble(funding, recipients, others, sender, fee, 1) {
            Ok(built) => built.paid,
            Err(err) => {
                return SearchOutcome {
                    candidate: Err(err),
                    viable: false,
                }
            }
        };

        let mut boundary = None;
        for count in (1..=most).rev().chain((most == 0).then_some(0)) {
            let candidate = self.search_count(funding, recipients, others, sender, fee, count);
            if let Ok(built) = &candidate {
                if built.paid == count && built.is_viable(&self.sizes) {
                    return SearchOutcome {
                        candidate,
                        viable: true,
                    };
                }
            }
            if boundary.is_none() {
                boundary = Some(candidate);
            }
        }

        let candidate = match boundary {
            Some(Ok(built)) if built.paid < most => Err(BuildError::InsufficientFunds {
                available: built.input_value,
                required: most as u64 * built.amount + fee + 1,
            }),
            Some(candidate) => candidate,
            None => Err(BuildError::NoValidBountyAmount { fee }),
        };
        SearchOutcome {
            candidate,
            viable: false,
        }
    }

    /// The candidate at the smallest amount that is not an affordable but
    /// unviable payment of `count` recipients, or the one at `fee` when every
    /// amount is.
    ///
    /// With the count fixed, affordability only drops and viability only
    /// rises as the amount grows, so that boundary splits `[1, fee]` in two.
    fn search_count(
        &self,
        funding: &Utxo,
        recipients: &[Recipient],
        others: &[Utxo],
        sender: &Script,
        fee: u64,
        count: usize,
    ) -> Result<BountyTx, BuildError> {
        let (mut lo, mut hi) = (1u64, fee);
        let mut found = None;
        let mut below = Err(BuildError::NoValidBountyAmount { fee });

        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let candidate =
                self.assemble_paying(funding, recipients, others, sender, fee, mid, count);
            match &candidate {
                Ok(built) if built.paid == count && !built.is_viable(&self.sizes) => {
                    lo = mid + 1;
                    below = candidate;
                }
                _ => {
                    hi = mid - 1;
                    found = Some(candidate);
                }
            }
        }
        found.unwrap_or(below)
    }

    /// The transaction for one fixed bounty `amount`. Payouts are only added
    /// while the change stays positive after the fee.
    pub fn assemble(
        &self,
        funding: &Utxo,
        recipients: &[Recipient],
        others: &[Utxo],
        sender: &Script,
        fee: u64,
        amount: u64,
    ) -> Result<BountyTx, BuildError> {
        self.assemble_paying(funding, recipients, others, sender, fee, amount, usize::MAX)
    }

    /// Same as [`Self::assemble`] but pays at most `limit` recipients.
    #[allow(clippy::too_many_arguments)]
    fn assemble_paying(
        &self,
        funding: &Utxo,
        recipients: &[Recipient],
        others: &[Utxo],
        sender: &Script,
        fee: u64,
        amount: u64,
        limit: usize,
    ) -> Result<BountyTx, BuildError> {
        let scripts: Vec<&ScriptBuf> = recipients
            .iter()
            .filter_map(|r| r.payout_script())
            .take(limit)
            .collect();

        let mut input = Vec::with_capacity(1 + others.len());
        let mut output = vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: memo_script(&self.memo)?,
        }];
        let mut input_value = 0u64;
        let mut paid = 0usize;

        for utxo in std::iter::once(funding).chain(others.iter()) {
            input.push(TxIn::from(utxo));
            input_value += utxo.value;

            while paid < scripts.len() && (paid as u64 + 1) * amount + fee < input_value {
                output.push(TxOut {
                    value: Amount::from_sat(amount),
                    script_pubkey: scripts[paid].clone(),
                });
                paid += 1;
            }
            if paid == scripts.len() && paid as u64 * amount + fee < input_value {
                break;
            }
        }

        let bounty_value = paid as u64 * amount;
        if (paid == 0 && !scripts.is_empty()) || bounty_value + fee >= input_value {
            return Err(BuildError::InsufficientFunds {
                available: input_value,
                required: bounty_value.max(amount) + fee + 1,
            });
        }

        output.push(TxOut {
            value: Amount::from_sat(input_value - bounty_value - fee),
            script_pubkey: sender.to_owned(),
        });

        Ok(BountyTx {
            tx: Transaction {
                version: Version::ONE,
                lock_time: LockTime::ZERO,
                input,
                output,
            },
            amount,
            fee,
            input_value,
            paid,
        })
    }
}

/// Signs every input of `tx` as a pay-to-pubkey-hash spend of `sender`.
pub async fn sign_transaction<S>(
    mut tx: Transaction,
    sender: &Script,
    pubkey: &PublicKey,
    signer: &S,
) -> Result<Transaction, Error>
where
    S: Signer + ?Sized,
{
    let (inputs, outputs) = (tx.input.len(), tx.output.len());

    let digests = {
        let sighasher = SighashCache::new(&tx);
        (0..inputs)
            .map(|i| sighasher.legacy_signature_hash(i, sender, EcdsaSighashType::All.to_u32()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::Signing(err_string(e)))?
    };

    for (i, digest) in digests.into_iter().enumerate() {
        let sig = signer
            .sign(digest.to_byte_array())
            .await
            .map_err(Error::Signing)?;
        let signature = secp256k1::ecdsa::Signature::from_compact(&sig)
            .map_err(|e| Error::Signing(err_string(e)))?;
        tx.input[i].script_sig = ScriptBuf::builder()
            .push_slice(ecdsa::Signature::sighash_all(signature).serialize())
            .push_key(pubkey)
            .into_script();
    }

    let decoded: Transaction =
        deserialize(&serialize(&tx)).map_err(|e| Error::Decode(err_string(e)))?;
    if decoded.input.len() != inputs || decoded.output.len() != outputs {
        return Err(BuildError::ShapeChanged(format!(
            "{inputs} inputs and {outputs} outputs became {} and {}",
            decoded.input.len(),
            decoded.output.len()
        ))
        .into());
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{find_memo, memo_payload};
    use crate::testing::*;
    use async_trait::async_trait;
    use bitcoin::{
        script::Instruction,
        secp256k1::{Message, Secp256k1, SecretKey},
        BlockHash, OutPoint,
    };

    fn recipient(tag: u8) -> Recipient {
        let tx = spend(OutPoint::new(seed_txid(0xaa), 1), vec![pay(0x01, 1), pay(tag, 700)], 0);
        Recipient {
            txid: tx.compute_txid(),
            block_hash: BlockHash::all_zeros(),
            tx,
        }
    }

    fn builder() -> TxBuilder {
        TxBuilder::from_config(&RelayConfig::testnet())
    }

    fn input_sum(built: &BountyTx, utxos: &[Utxo]) -> u64 {
        built
            .tx
            .input
            .iter()
            .map(|i| {
                utxos
                    .iter()
                    .find(|u| u.outpoint() == i.previous_output)
                    .unwrap()
                    .value
            })
            .sum()
    }

    #[test]
    fn fee_parsing() {
        assert_eq!(parse_fee("999"), Ok(999));
        assert_eq!(parse_fee(" 1306\n"), Ok(1306));
        assert_eq!(parse_fee("0"), Err(BuildError::InvalidFee("0".to_string())));
        assert!(parse_fee("-5").is_err());
        assert!(parse_fee("1.5").is_err());
        assert!(parse_fee("").is_err());
    }

    #[test]
    fn smallest_viable_amount_for_three_recipients() {
        let funding = utxo(1, 100_000);
        let recipients = [recipient(0x11), recipient(0x12), recipient(0x13)];
        let built = builder()
            .build(&funding, &recipients, &[], &p2pkh(0xee), 999)
            .unwrap();

        // 206 unsigned bytes + 107 for the signature; 182 * 999 / 313 rounds up to 581
        assert_eq!(estimated_size(&built.tx, &SizeEstimates::DEFAULT), 313);
        assert_eq!(built.amount, 581);
        assert_eq!(built.paid, 3);
        assert_eq!(built.change(), 100_000 - 3 * 581 - 999);

        let tx = &built.tx;
        assert_eq!(tx.output.len(), 5);
        assert_eq!(tx.output[0].value, Amount::ZERO);
        assert_eq!(find_memo(tx).as_deref(), Some("endur.io"));
        for (o, r) in tx.output[1..4].iter().zip(recipients.iter()) {
            assert_eq!(o.value.to_sat(), 581);
            assert_eq!(Some(&o.script_pubkey), r.payout_script());
        }
        assert_eq!(tx.output[4].script_pubkey, p2pkh(0xee));

        let outputs: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        assert_eq!(outputs + built.fee, input_sum(&built, &[funding]));

        // one less is not viable
        let smaller = builder()
            .assemble(&funding, &recipients, &[], &p2pkh(0xee), 999, 580)
            .unwrap();
        assert!(!smaller.is_viable(&SizeEstimates::DEFAULT));
    }

    #[test]
    fn tight_funds_keep_the_most_recipients() {
        let funding = utxo(1, 2_332);
        let recipients = [recipient(0x21), recipient(0x22)];
        let b = builder();

        // a larger amount pays one recipient less and is unviable again
        let two = b
            .assemble(&funding, &recipients, &[], &p2pkh(0xee), 999, 652)
            .unwrap();
        assert_eq!(two.paid, 2);
        assert!(two.is_viable(&SizeEstimates::DEFAULT));
        let one = b
            .assemble(&funding, &recipients, &[], &p2pkh(0xee), 999, 700)
            .unwrap();
        assert_eq!(one.paid, 1);
        assert!(!one.is_viable(&SizeEstimates::DEFAULT));

        let built = b
            .build(&funding, &recipients, &[], &p2pkh(0xee), 999)
            .unwrap();
        assert_eq!(built.paid, 2);
        assert!(built.amount <= 652);
        let smaller = b
            .assemble(&funding, &recipients, &[], &p2pkh(0xee), 999, built.amount - 1)
            .unwrap();
        assert_eq!(smaller.paid, 2);
        assert!(!smaller.is_viable(&SizeEstimates::DEFAULT));
    }

    #[test]
    fn unpayable_amounts_search_lower() {
        let sizes = SizeEstimates {
            signature_bytes: 0,
            input_fixed_bytes: 0,
            output_fixed_bytes: 0,
        };
        let b = TxBuilder::new("endur.io", sizes);
        let funding = utxo(1, 1_300);
        let recipients = [recipient(0x23)];

        assert!(b
            .assemble(&funding, &recipients, &[], &p2pkh(0xee), 999, 250)
            .unwrap()
            .is_viable(&sizes));
        assert!(b
            .assemble(&funding, &recipients, &[], &p2pkh(0xee), 999, 500)
            .is_err());

        let built = b
            .build(&funding, &recipients, &[], &p2pkh(0xee), 999)
            .unwrap();
        assert_eq!(built.paid, 1);
        assert!(built.amount <= 250);
        assert!(built.change() > 0);
    }

    #[test]
    fn search_matches_an_exhaustive_sweep() {
        let b = builder();
        let all = [
            recipient(0x24),
            recipient(0x25),
            recipient(0x26),
            recipient(0x27),
        ];
        let sender = p2pkh(0xee);
        let fee = 999;

        for n in 1..=all.len() {
            let recipients = &all[..n];
            for value in (1_000..6_000).step_by(127) {
                let funding = utxo(1, value);
                let mut expected = None;
                'counts: for count in (1..=n).rev() {
                    for amount in 1..=fee {
                        let Ok(built) = b.assemble_paying(
                            &funding, recipients, &[], &sender, fee, amount, count,
                        ) else {
                            continue;
                        };
                        if built.paid == count && built.is_viable(&SizeEstimates::DEFAULT) {
                            expected = Some((count, amount));
                            break 'counts;
                        }
                    }
                }

                let got = b
                    .build(&funding, recipients, &[], &sender, fee)
                    .ok()
                    .map(|built| (built.paid, built.amount));
                assert_eq!(got, expected, "{n} recipients, funding {value}");
            }
        }
    }

    #[test]
    fn inputs_are_consumed_in_order_until_enough() {
        let funding = utxo(1, 600);
        let others = [utxo(2, 50_000), utxo(3, 50_000)];
        let recipients = [recipient(0x31), recipient(0x32), recipient(0x33)];
        let built = builder()
            .build(&funding, &recipients, &others, &p2pkh(0xee), 999)
            .unwrap();

        let spent: Vec<OutPoint> = built.tx.input.iter().map(|i| i.previous_output).collect();
        assert_eq!(spent, vec![funding.outpoint(), others[0].outpoint()]);
        // 247 unsigned bytes + 2 * 107
        assert_eq!(built.amount, 395);
        assert_eq!(built.paid, 3);
        assert_eq!(built.change(), 50_600 - 3 * 395 - 999);

        let all = [funding, others[0], others[1]];
        let outputs: u64 = built.tx.output.iter().map(|o| o.value.to_sat()).sum();
        assert_eq!(outputs + built.fee, input_sum(&built, &all));
    }

    #[test]
    fn pays_a_prefix_when_funds_run_short() {
        let funding = utxo(1, 2_500);
        let recipients = [recipient(0x41), recipient(0x42), recipient(0x43)];
        let built = builder()
            .build(&funding, &recipients, &[], &p2pkh(0xee), 999)
            .unwrap();
        assert!(built.paid >= 1 && built.paid < 3);
        assert!(built.change() > 0);
        assert_eq!(built.bounty_outputs().len(), built.paid);
        assert_eq!(
            built.bounty_outputs()[0].script_pubkey,
            recipients[0].payout_script().unwrap().clone()
        );
    }

    #[test]
    fn insufficient_funds() {
        let recipients = [recipient(0x51)];
        let err = builder()
            .build(&utxo(1, 1000), &recipients, &[], &p2pkh(0xee), 999)
            .unwrap_err();
        assert!(matches!(err, BuildError::InsufficientFunds { available: 1000, .. }), "{err}");

        let err = builder()
            .build(&utxo(1, 1500), &recipients, &[], &p2pkh(0xee), 999)
            .unwrap_err();
        assert!(matches!(err, BuildError::InsufficientFunds { .. }), "{err}");

        let err = builder()
            .build(&utxo(1, 999), &[], &[], &p2pkh(0xee), 999)
            .unwrap_err();
        assert!(matches!(err, BuildError::InsufficientFunds { .. }), "{err}");
    }

    #[test]
    fn invalid_fee_and_no_viable_amount() {
        let recipients = [recipient(0x61)];
        let err = builder()
            .build(&utxo(1, 100_000), &recipients, &[], &p2pkh(0xee), 0)
            .unwrap_err();
        assert_eq!(err, BuildError::InvalidFee("0".to_string()));

        // outputs priced far above anything the transaction size can carry
        let sizes = SizeEstimates {
            output_fixed_bytes: 1000,
            ..SizeEstimates::DEFAULT
        };
        let b = TxBuilder::new("endur.io", sizes);
        let outcome = b.search(&utxo(1, 1_000_000), &recipients, &[], &p2pkh(0xee), 999);
        assert!(!outcome.viable);
        // the last examined candidate is kept
        assert_eq!(outcome.candidate.unwrap().amount, 999);
        let err = b
            .build(&utxo(1, 1_000_000), &recipients, &[], &p2pkh(0xee), 999)
            .unwrap_err();
        assert_eq!(err, BuildError::NoValidBountyAmount { fee: 999 });
    }

    #[test]
    fn memo_carries_the_multiplier() {
        let mut cfg = RelayConfig::testnet();
        cfg.xmine = 3;
        let built = TxBuilder::from_config(&cfg)
            .build(&utxo(1, 100_000), &[recipient(0x71)], &[], &p2pkh(0xee), 999)
            .unwrap();
        assert_eq!(
            memo_payload(&built.tx.output[0].script_pubkey),
            Some(&b"endur.io x3"[..])
        );
    }

    struct KeySigner {
        secp: Secp256k1<bitcoin::secp256k1::All>,
        key: SecretKey,
    }

    #[async_trait]
    impl Signer for KeySigner {
        async fn sign(&self, digest: [u8; 32]) -> Result<Vec<u8>, String> {
            let msg = Message::from_digest(digest);
            Ok(self.secp.sign_ecdsa(&msg, &self.key).serialize_compact().to_vec())
        }
    }

    struct BrokenSigner;

    #[async_trait]
    impl Signer for BrokenSigner {
        async fn sign(&self, _digest: [u8; 32]) -> Result<Vec<u8>, String> {
            Ok(vec![0u8; 10])
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn signs_every_input() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pubkey = PublicKey::new(key.public_key(&secp));
        let sender = ScriptBuf::new_p2pkh(&pubkey.pubkey_hash());
        let signer = KeySigner { secp, key };

        let built = builder()
            .build(
                &utxo(1, 600),
                &[recipient(0x81)],
                &[utxo(2, 50_000)],
                &sender,
                999,
            )
            .unwrap();
        let unsigned = built.tx.clone();
        let signed = sign_transaction(built.tx, &sender, &pubkey, &signer)
            .await
            .unwrap();
        assert_ne!(signed.compute_txid(), unsigned.compute_txid());
        assert_eq!(signed.output, unsigned.output);

        let secp = Secp256k1::verification_only();
        let sighasher = SighashCache::new(&unsigned);
        for (i, input) in signed.input.iter().enumerate() {
            let pushes: Vec<Vec<u8>> = input
                .script_sig
                .instructions()
                .map(|ins| match ins.unwrap() {
                    Instruction::PushBytes(b) => b.as_bytes().to_vec(),
                    Instruction::Op(op) => panic!("unexpected {op}"),
                })
                .collect();
            assert_eq!(pushes.len(), 2);
            assert_eq!(pushes[1], pubkey.to_bytes());

            let sig = ecdsa::Signature::from_slice(&pushes[0]).unwrap();
            assert_eq!(sig.sighash_type, EcdsaSighashType::All);
            let digest = sighasher
                .legacy_signature_hash(i, &sender, EcdsaSighashType::All.to_u32())
                .unwrap();
            let msg = Message::from_digest(digest.to_byte_array());
            secp.verify_ecdsa(&msg, &sig.signature, &pubkey.inner)
                .unwrap();
        }

        let err = sign_transaction(unsigned, &sender, &pubkey, &BrokenSigner)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Signing(_)), "{err}");
    }
}
