//! Create spend transactions from a set of wallet coins.
//!
//! A subset of the spendable outputs is selected to cover the sent amount
//! and the mining fee, and a change output is added when the leftover is
//! worth more than its own spending cost.

use crate::{
    sign::Address,
    txsizes::{estimate_vsize, fee_for_vsize, is_dust_amount, P2PKH_PK_SCRIPT_SIZE},
};

use std::{cmp::Ordering, collections::HashMap, error, fmt, sync::Arc};

use miniscript::bitcoin::{
    absolute, hashes::Hash, transaction, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendCreationError {
    InsufficientFunds,
    InsufficientFundsForFee,
    InvalidAmount(Amount),
    InvalidChangeScript(/* script size */ usize),
    /// The fee estimation loop did not settle within its iteration bound.
    FeeEstimationDiverged,
}

impl fmt::Display for SpendCreationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InsufficientFunds => write!(f, "Insufficient funds."),
            Self::InsufficientFundsForFee => write!(f, "Insufficient funds to pay for the fee."),
            Self::InvalidAmount(amount) => write!(f, "Invalid send amount '{}'.", amount),
            Self::InvalidChangeScript(size) => write!(
                f,
                "Fee estimation requires change scripts no larger than P2PKH output scripts, \
                got {} bytes.",
                size
            ),
            Self::FeeEstimationDiverged => write!(
                f,
                "BUG! Please report this. Fee estimation did not converge."
            ),
        }
    }
}

impl error::Error for SpendCreationError {}

/// The data needed for a new transaction to be able to display it and sign
/// it.
#[derive(Clone)]
pub struct TxProposal {
    /// Amount sent out. The fee is not included and is deducted on top.
    pub amount: Amount,
    /// Mining fee used.
    pub fee: Amount,
    pub transaction: Transaction,
    /// The wallet address receiving the change of the transaction, if any.
    pub change_address: Option<Arc<dyn Address>>,
}

impl fmt::Debug for TxProposal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TxProposal")
            .field("amount", &self.amount)
            .field("fee", &self.fee)
            .field("txid", &self.transaction.compute_txid())
            .field("has_change", &self.change_address.is_some())
            .finish()
    }
}

// BIP-69 orders txids by their big-endian (displayed) representation, the
// reverse of their in-memory byte order.
fn txid_be_bytes(txid: &Txid) -> [u8; 32] {
    let mut bytes = txid.to_byte_array();
    bytes.reverse();
    bytes
}

fn bip69_input_ordering(a: &TxIn, b: &TxIn) -> Ordering {
    txid_be_bytes(&a.previous_output.txid)
        .cmp(&txid_be_bytes(&b.previous_output.txid))
        .then_with(|| a.previous_output.vout.cmp(&b.previous_output.vout))
}

fn bip69_output_ordering(a: &TxOut, b: &TxOut) -> Ordering {
    a.value
        .cmp(&b.value)
        .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
}

/// Sort the inputs and outputs of a transaction as per BIP-69, so two
/// wallets produce byte-identical transactions from the same logical intent.
pub fn bip69_sort(transaction: &mut Transaction) {
    transaction.input.sort_by(bip69_input_ordering);
    transaction.output.sort_by(bip69_output_ordering);
}

/// Whether the inputs and outputs of this transaction are in BIP-69 order.
pub fn is_bip69_sorted(transaction: &Transaction) -> bool {
    transaction
        .input
        .windows(2)
        .all(|pair| bip69_input_ordering(&pair[0], &pair[1]) != Ordering::Greater)
        && transaction
            .output
            .windows(2)
            .all(|pair| bip69_output_ordering(&pair[0], &pair[1]) != Ordering::Greater)
}

fn unsigned_input(out_point: &OutPoint) -> TxIn {
    TxIn {
        previous_output: *out_point,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

// Select coins to cover at least `min_amount`, largest first. Ties between
// equal-value coins are broken by big-endian txid then vout, so selection is
// deterministic.
fn coin_selection(
    min_amount: Amount,
    spendable_outputs: &HashMap<OutPoint, TxOut>,
) -> Result<(Amount, Vec<OutPoint>), SpendCreationError> {
    let mut out_points: Vec<OutPoint> = spendable_outputs.keys().copied().collect();
    out_points.sort_by(|a, b| {
        spendable_outputs[b]
            .value
            .cmp(&spendable_outputs[a].value)
            .then_with(|| txid_be_bytes(&a.txid).cmp(&txid_be_bytes(&b.txid)))
            .then_with(|| a.vout.cmp(&b.vout))
    });

    let mut selected_out_points = Vec::new();
    let mut outputs_sum = Amount::ZERO;
    for out_point in out_points {
        if outputs_sum >= min_amount {
            break;
        }
        outputs_sum = outputs_sum
            .checked_add(spendable_outputs[&out_point].value)
            .expect("sum of spendable outputs must fit in an amount");
        selected_out_points.push(out_point);
    }
    if outputs_sum < min_amount {
        return Err(SpendCreationError::InsufficientFunds);
    }
    Ok((outputs_sum, selected_out_points))
}

/// Create a transaction spending all spendable outputs to a single recipient
/// script. The fee is deducted from the sent amount.
pub fn create_spend_all(
    spendable_outputs: &HashMap<OutPoint, TxOut>,
    recipient_pk_script: ScriptBuf,
    fee_rate_per_kvb: Amount,
) -> Result<TxProposal, SpendCreationError> {
    let mut inputs = Vec::with_capacity(spendable_outputs.len());
    let mut outputs_sum = Amount::ZERO;
    for (out_point, tx_out) in spendable_outputs {
        outputs_sum = outputs_sum
            .checked_add(tx_out.value)
            .expect("sum of spendable outputs must fit in an amount");
        inputs.push(unsigned_input(out_point));
    }

    let mut output = TxOut {
        value: Amount::ZERO,
        script_pubkey: recipient_pk_script,
    };
    let vsize = estimate_vsize(inputs.len(), std::slice::from_ref(&output), false);
    let fee = fee_for_vsize(fee_rate_per_kvb, vsize);
    if outputs_sum <= fee {
        return Err(SpendCreationError::InsufficientFundsForFee);
    }
    output.value = outputs_sum
        .checked_sub(fee)
        .expect("the inputs sum is larger than the fee");

    let amount = output.value;
    let mut transaction = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: inputs,
        output: vec![output],
    };
    bip69_sort(&mut transaction);
    log::debug!("Preparing transaction to spend all outputs, fee: {}.", fee);
    Ok(TxProposal {
        amount,
        fee,
        transaction,
        change_address: None,
    })
}

/// Create a transaction sending `recipient_output` out of a subset of the
/// spendable outputs. A change output paying to an address from
/// `get_change_address` is added when the leftover is not dust, otherwise
/// the leftover goes to the fee.
pub fn create_spend<F>(
    spendable_outputs: &HashMap<OutPoint, TxOut>,
    recipient_output: TxOut,
    fee_rate_per_kvb: Amount,
    get_change_address: F,
) -> Result<TxProposal, SpendCreationError>
where
    F: Fn() -> Arc<dyn Address>,
{
    let target_amount = recipient_output.value;
    if target_amount == Amount::ZERO || target_amount > Amount::MAX_MONEY {
        return Err(SpendCreationError::InvalidAmount(target_amount));
    }

    let outputs = [recipient_output];
    let mut target_fee = fee_for_vsize(fee_rate_per_kvb, estimate_vsize(1, &outputs, true));

    // Covering the fee can require another input, which in turn increases
    // the fee. Iterate until the selection covers both. Eventual selection
    // of every spendable output bounds the loop, anything beyond that is a
    // bug.
    for _ in 0..spendable_outputs.len() + 2 {
        let min_amount = target_amount
            .checked_add(target_fee)
            .expect("target amount and fee must fit in an amount");
        let (selected_sum, selected_out_points) = coin_selection(min_amount, spendable_outputs)?;

        let vsize = estimate_vsize(selected_out_points.len(), &outputs, true);
        let max_required_fee = fee_for_vsize(fee_rate_per_kvb, vsize);
        let selected_excess = selected_sum
            .checked_sub(target_amount)
            .expect("the selection covers at least the target amount");
        if selected_excess < max_required_fee {
            target_fee = max_required_fee;
            continue;
        }

        let change_amount = selected_excess
            .checked_sub(max_required_fee)
            .expect("the selection covers the target amount and the fee");
        let change_is_dust =
            is_dust_amount(change_amount, P2PKH_PK_SCRIPT_SIZE, fee_rate_per_kvb);
        let fee = if change_is_dust {
            selected_excess
        } else {
            max_required_fee
        };

        let mut transaction = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: selected_out_points.iter().map(unsigned_input).collect(),
            output: vec![outputs[0].clone()],
        };
        let mut change_address = None;
        if change_amount > Amount::ZERO && !change_is_dust {
            let address = get_change_address();
            let change_pk_script = address.pk_script();
            if change_pk_script.len() > P2PKH_PK_SCRIPT_SIZE {
                return Err(SpendCreationError::InvalidChangeScript(
                    change_pk_script.len(),
                ));
            }
            transaction.output.push(TxOut {
                value: change_amount,
                script_pubkey: change_pk_script,
            });
            change_address = Some(address);
        }
        bip69_sort(&mut transaction);
        log::debug!("Preparing transaction, fee: {}.", fee);
        return Ok(TxProposal {
            amount: target_amount,
            fee,
            transaction,
            change_address,
        });
    }

    Err(SpendCreationError::FeeEstimationDiverged)
}
