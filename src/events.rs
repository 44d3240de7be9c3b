//! Chain payloads published by the gateway
//!
//! Field names follow the JSON the gateway has always emitted, so existing
//! subscribers keep decoding them unchanged.

use crate::topics::{Topic, TopicError};
use serde::{Deserialize, Serialize};

/// A payload that knows which topic it is published under
pub trait Publishable: Serialize {
    fn topic(&self) -> Result<Topic, TopicError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub hash: String,
    pub number: u64,
    pub time: u64,
    pub parent_hash: String,
    pub difficulty: String,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub nonce: u64,
}

impl Publishable for Block {
    fn topic(&self) -> Result<Topic, TopicError> {
        Ok(Topic::block())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    /// Empty for contract creation, and then left out of the JSON
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    /// Address of the created contract, only sent for contract creation
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub contract: String,
    pub value: String,
    pub data: String,
    pub gas: u64,
    pub gas_price: String,
    pub cost: String,
    pub nonce: u64,
    pub state: u64,
    pub block_hash: String,
}

impl Transaction {
    pub fn is_contract_creation(&self) -> bool {
        self.to.is_empty()
    }
}

impl Publishable for Transaction {
    fn topic(&self) -> Result<Topic, TopicError> {
        Ok(Topic::transaction(&self.from, &self.to))
    }
}

/// Log entry emitted by a contract
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub origin: String,
    pub index: u32,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "txHash")]
    pub transaction_hash: String,
    pub block_hash: String,
}

impl Publishable for LogEvent {
    /// Fails for more than four log topics
    fn topic(&self) -> Result<Topic, TopicError> {
        Topic::event(&self.origin, self.topics.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::TopicPattern;

    #[test]
    fn test_block_wire_names() {
        let block = Block {
            hash: "0xh".into(),
            number: 12,
            parent_hash: "0xp".into(),
            gas_used: 21000,
            ..Default::default()
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["parentHash"], "0xp");
        assert_eq!(value["gasUsed"], 21000);
        assert_eq!(value["gasLimit"], 0);
        assert_eq!(block.topic().unwrap(), Topic::Block);
    }

    #[test]
    fn test_transaction_topic() {
        let tx = Transaction {
            from: "0xA".into(),
            to: "0xB".into(),
            gas_price: "1".into(),
            ..Default::default()
        };
        assert_eq!(tx.topic().unwrap().to_string(), "transaction/0xA/0xB");

        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["gasPrice"], "1");
        assert_eq!(value["to"], "0xB");
        assert!(value.get("contract").is_none());

        let decoded: Transaction = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn test_contract_creation_matched_only_by_wildcard() {
        let tx = Transaction {
            from: "0xA".into(),
            contract: "0xC".into(),
            ..Default::default()
        };
        assert!(tx.is_contract_creation());

        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["contract"], "0xC");
        assert!(value.get("to").is_none());

        let topic = tx.topic().unwrap();
        assert!(TopicPattern::parse("transaction/0xA/*").unwrap().matches(&topic));
        assert!(!TopicPattern::parse("transaction/0xA/0xC").unwrap().matches(&topic));
    }

    #[test]
    fn test_log_event_topic() {
        let log = LogEvent {
            origin: "0xC".into(),
            topics: vec!["0xT0".into(), "0xT1".into()],
            transaction_hash: "0xtx".into(),
            ..Default::default()
        };
        let topic = log.topic().unwrap();
        assert_eq!(topic.to_string(), "event/0xC/0xT0/0xT1//");
        assert!(TopicPattern::parse("event/0xC/0xT0/*/*/*").unwrap().matches(&topic));
        assert_eq!(serde_json::to_value(&log).unwrap()["txHash"], "0xtx");

        let too_many = LogEvent {
            topics: vec!["0x1".into(); 5],
            ..log
        };
        assert!(too_many.topic().is_err());
    }
}
