//! Transaction size estimation and fee arithmetic.
//!
//! All estimations assume the wallet spends P2WPKH-nested-in-P2SH coins,
//! and that change scripts are no larger than a P2PKH output script.

use miniscript::bitcoin::{Amount, TxOut};

/// Size in bytes of a P2PKH output script. Change output scripts must not
/// be larger than this, as assumed by the size estimation.
pub const P2PKH_PK_SCRIPT_SIZE: usize = 25;

// Non-witness size of an input spending a P2WPKH-nested-in-P2SH coin:
// 36 bytes outpoint, 1 byte scriptSig length, 23 bytes scriptSig (the push
// of the 22-byte redeem script), 4 bytes sequence.
const NESTED_P2WPKH_INPUT_SIZE: u64 = 36 + 1 + 23 + 4;

// Witness of such an input: item count, then a 73-byte signature (including
// the sighash byte) and a 33-byte compressed pubkey, each length-prefixed.
const NESTED_P2WPKH_WITNESS_SIZE: u64 = 1 + 1 + 73 + 1 + 33;

// A P2PKH output: 8 bytes value, script length, script.
const P2PKH_OUTPUT_SIZE: u64 = 8 + 1 + P2PKH_PK_SCRIPT_SIZE as u64;

// Non-witness size of an input redeeming a P2PKH output, as assumed by the
// dust threshold.
const P2PKH_REDEEM_INPUT_SIZE: u64 = 148;

fn varint_size(value: u64) -> u64 {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Estimate the virtual size in bytes of a fully signed transaction with
/// `num_inputs` inputs and the given outputs, plus a P2PKH-sized change
/// output if `include_change` is set.
pub fn estimate_vsize(num_inputs: usize, outputs: &[TxOut], include_change: bool) -> u64 {
    let num_inputs = num_inputs as u64;
    let num_outputs = outputs.len() as u64 + include_change as u64;

    let mut base: u64 = 4 + 4; // version and locktime
    base += varint_size(num_inputs) + num_inputs * NESTED_P2WPKH_INPUT_SIZE;
    base += varint_size(num_outputs);
    for tx_out in outputs {
        let script_size = tx_out.script_pubkey.len() as u64;
        base += 8 + varint_size(script_size) + script_size;
    }
    if include_change {
        base += P2PKH_OUTPUT_SIZE;
    }
    let witness = 2 + num_inputs * NESTED_P2WPKH_WITNESS_SIZE; // marker and flag

    // Witness bytes are discounted to a quarter of their size, rounded up.
    (base * 4 + witness + 3) / 4
}

/// The fee for a transaction of `vsize` virtual bytes at the given fee rate
/// in satoshis per 1000 virtual bytes, rounded up.
pub fn fee_for_vsize(fee_rate_per_kvb: Amount, vsize: u64) -> Amount {
    let fee = fee_rate_per_kvb
        .to_sat()
        .checked_mul(vsize)
        .and_then(|product| product.checked_add(999))
        .expect("fee computation must not overflow")
        / 1000;
    Amount::from_sat(fee)
}

/// Whether an output of this amount paying to a script of `script_size`
/// bytes is considered dust at the given relay fee rate: its amount does not
/// cover three times the cost of creating and spending it.
pub fn is_dust_amount(amount: Amount, script_size: usize, relay_fee_per_kvb: Amount) -> bool {
    let script_size = script_size as u64;
    let total_size = 8 + varint_size(script_size) + script_size + P2PKH_REDEEM_INPUT_SIZE;
    let fee_covered = amount
        .to_sat()
        .checked_mul(1000)
        .expect("dust computation must not overflow")
        / (3 * total_size);
    fee_covered < relay_fee_per_kvb.to_sat()
}
