//! Covenant account templates.
//!
//! A template is a contract artifact: named constructor inputs plus one
//! tapscript leaf per spending function, written as ASM tokens. Tokens
//! are opcodes (`OP_CHECKSIG`), hex literals, or `$name` placeholders
//! filled from the constructor arguments at derivation time.

use std::collections::BTreeMap;

use lwk_wollet::elements::opcodes;
use lwk_wollet::elements::script::Builder;
use lwk_wollet::elements::secp256k1_zkp::XOnlyPublicKey;
use lwk_wollet::elements::Script;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::taproot;

/// Constructor argument values keyed by input name.
pub type ConstructorArgs = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    Bytes,
    #[serde(rename = "xonlypublickey")]
    XOnlyPublicKey,
    Asset,
    Value,
}

impl ArgKind {
    fn expected_len(self) -> Option<usize> {
        match self {
            ArgKind::Bytes => None,
            ArgKind::XOnlyPublicKey | ArgKind::Asset => Some(32),
            ArgKind::Value => Some(8),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructorInput {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ArgKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateFunction {
    pub name: String,
    pub asm: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CovenantTemplate {
    pub contract_name: String,
    #[serde(default)]
    pub constructor_inputs: Vec<ConstructorInput>,
    pub functions: Vec<TemplateFunction>,
}

fn opcode(token: &str) -> Option<u8> {
    if let Some(n) = token.strip_prefix("OP_").and_then(|n| n.parse::<u8>().ok()) {
        return match n {
            0 => Some(0x00),
            1..=16 => Some(0x50 + n),
            _ => None,
        };
    }
    let byte = match token {
        "OP_FALSE" => 0x00,
        "OP_1NEGATE" => 0x4f,
        "OP_TRUE" => 0x51,
        "OP_NOP" => 0x61,
        "OP_IF" => 0x63,
        "OP_NOTIF" => 0x64,
        "OP_ELSE" => 0x67,
        "OP_ENDIF" => 0x68,
        "OP_VERIFY" => 0x69,
        "OP_RETURN" => 0x6a,
        "OP_TOALTSTACK" => 0x6b,
        "OP_FROMALTSTACK" => 0x6c,
        "OP_2DROP" => 0x6d,
        "OP_2DUP" => 0x6e,
        "OP_3DUP" => 0x6f,
        "OP_2OVER" => 0x70,
        "OP_2ROT" => 0x71,
        "OP_2SWAP" => 0x72,
        "OP_IFDUP" => 0x73,
        "OP_DEPTH" => 0x74,
        "OP_DROP" => 0x75,
        "OP_DUP" => 0x76,
        "OP_NIP" => 0x77,
        "OP_OVER" => 0x78,
        "OP_PICK" => 0x79,
        "OP_ROLL" => 0x7a,
        "OP_ROT" => 0x7b,
        "OP_SWAP" => 0x7c,
        "OP_TUCK" => 0x7d,
        "OP_CAT" => 0x7e,
        "OP_SUBSTR" => 0x7f,
        "OP_LEFT" => 0x80,
        "OP_RIGHT" => 0x81,
        "OP_SIZE" => 0x82,
        "OP_EQUAL" => 0x87,
        "OP_EQUALVERIFY" => 0x88,
        "OP_1ADD" => 0x8b,
        "OP_1SUB" => 0x8c,
        "OP_NEGATE" => 0x8f,
        "OP_ABS" => 0x90,
        "OP_NOT" => 0x91,
        "OP_0NOTEQUAL" => 0x92,
        "OP_ADD" => 0x93,
        "OP_SUB" => 0x94,
        "OP_BOOLAND" => 0x9a,
        "OP_BOOLOR" => 0x9b,
        "OP_NUMEQUAL" => 0x9c,
        "OP_NUMEQUALVERIFY" => 0x9d,
        "OP_NUMNOTEQUAL" => 0x9e,
        "OP_LESSTHAN" => 0x9f,
        "OP_GREATERTHAN" => 0xa0,
        "OP_LESSTHANOREQUAL" => 0xa1,
        "OP_GREATERTHANOREQUAL" => 0xa2,
        "OP_MIN" => 0xa3,
        "OP_MAX" => 0xa4,
        "OP_WITHIN" => 0xa5,
        "OP_RIPEMD160" => 0xa6,
        "OP_SHA1" => 0xa7,
        "OP_SHA256" => 0xa8,
        "OP_HASH160" => 0xa9,
        "OP_HASH256" => 0xaa,
        "OP_CHECKSIG" => 0xac,
        "OP_CHECKSIGVERIFY" => 0xad,
        "OP_CHECKMULTISIG" => 0xae,
        "OP_CHECKMULTISIGVERIFY" => 0xaf,
        "OP_CHECKLOCKTIMEVERIFY" => 0xb1,
        "OP_CHECKSEQUENCEVERIFY" => 0xb2,
        "OP_CHECKSIGADD" => 0xba,
        "OP_CHECKSIGFROMSTACK" => 0xc1,
        "OP_CHECKSIGFROMSTACKVERIFY" => 0xc2,
        "OP_SHA256INITIALIZE" => 0xc4,
        "OP_SHA256UPDATE" => 0xc5,
        "OP_SHA256FINALIZE" => 0xc6,
        "OP_INSPECTINPUTOUTPOINT" => 0xc7,
        "OP_INSPECTINPUTASSET" => 0xc8,
        "OP_INSPECTINPUTVALUE" => 0xc9,
        "OP_INSPECTINPUTSCRIPTPUBKEY" => 0xca,
        "OP_INSPECTINPUTSEQUENCE" => 0xcb,
        "OP_INSPECTINPUTISSUANCE" => 0xcc,
        "OP_PUSHCURRENTINPUTINDEX" => 0xcd,
        "OP_INSPECTOUTPUTASSET" => 0xce,
        "OP_INSPECTOUTPUTVALUE" => 0xcf,
        "OP_INSPECTOUTPUTNONCE" => 0xd0,
        "OP_INSPECTOUTPUTSCRIPTPUBKEY" => 0xd1,
        "OP_INSPECTVERSION" => 0xd2,
        "OP_INSPECTLOCKTIME" => 0xd3,
        "OP_INSPECTNUMINPUTS" => 0xd4,
        "OP_INSPECTNUMOUTPUTS" => 0xd5,
        "OP_TXWEIGHT" => 0xd6,
        "OP_ADD64" => 0xd7,
        "OP_SUB64" => 0xd8,
        "OP_MUL64" => 0xd9,
        "OP_DIV64" => 0xda,
        "OP_NEG64" => 0xdb,
        "OP_LESSTHAN64" => 0xdc,
        "OP_LESSTHANOREQUAL64" => 0xdd,
        "OP_GREATERTHAN64" => 0xde,
        "OP_GREATERTHANOREQUAL64" => 0xdf,
        "OP_SCRIPTNUMTOLE64" => 0xe0,
        "OP_LE64TOSCRIPTNUM" => 0xe1,
        "OP_LE32TOLE64" => 0xe2,
        "OP_ECMULSCALARVERIFY" => 0xe3,
        "OP_TWEAKVERIFY" => 0xe4,
        _ => return None,
    };
    Some(byte)
}

impl CovenantTemplate {
    pub fn from_json(json: &str) -> Result<Self> {
        let template: Self =
            serde_json::from_str(json).map_err(|e| Error::Template(e.to_string()))?;
        if template.functions.is_empty() {
            return Err(Error::Template(format!(
                "{} declares no functions",
                template.contract_name
            )));
        }
        Ok(template)
    }

    /// Every constructor input must be present with the right width.
    pub fn check_args(&self, args: &ConstructorArgs) -> Result<()> {
        for input in &self.constructor_inputs {
            let value = args.get(&input.name).ok_or_else(|| {
                Error::Template(format!("missing constructor argument {}", input.name))
            })?;
            if let Some(len) = input.kind.expected_len() {
                if value.len() != len {
                    return Err(Error::Template(format!(
                        "argument {} must be {len} bytes, got {}",
                        input.name,
                        value.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Tapscript leaves, one per function, in declaration order.
    pub fn leaf_scripts(&self, args: &ConstructorArgs) -> Result<Vec<Script>> {
        self.check_args(args)?;
        self.functions
            .iter()
            .map(|f| compile_asm(&f.asm, args))
            .collect()
    }

    /// Output script for one derived key: the key is the taproot internal
    /// key and the function leaves form the script tree.
    pub fn script_pubkey(&self, internal_key: &XOnlyPublicKey, args: &ConstructorArgs) -> Result<Script> {
        let leaves = self
            .leaf_scripts(args)?
            .iter()
            .map(taproot::tapleaf_hash)
            .collect::<Vec<_>>();
        let root = taproot::merkle_root(&leaves)
            .ok_or_else(|| Error::Template("template has no leaves".into()))?;
        let (output_key, _parity) = taproot::output_key(internal_key, &root)?;
        Ok(taproot::p2tr_script(&output_key))
    }
}

fn compile_asm(tokens: &[String], args: &ConstructorArgs) -> Result<Script> {
    let mut builder = Builder::new();
    for token in tokens {
        builder = if let Some(name) = token.strip_prefix('$') {
            let value = args
                .get(name)
                .ok_or_else(|| Error::Template(format!("unbound placeholder ${name}")))?;
            builder.push_slice(value)
        } else if let Some(byte) = opcode(token) {
            builder.push_opcode(opcodes::All::from(byte))
        } else {
            let bytes = hex::decode(token)
                .map_err(|_| Error::Template(format!("unknown token {token}")))?;
            builder.push_slice(&bytes)
        };
    }
    Ok(builder.into_script())
}
