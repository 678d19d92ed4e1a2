use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_program;
use tracing::{debug, warn};

use crate::codec::{self, DecodeError};
use crate::constants::{
    AMM_POOL_INDEX, AMM_USER_INDEX, BUY_DISCRIMINATOR, COLLECT_FEE_DISCRIMINATOR,
    CREATE_BONDING_CURVE_INDEX, CREATE_DISCRIMINATOR, DEPOSIT_DISCRIMINATOR, PROGRAM_DATA_PREFIX,
    SELL_DISCRIMINATOR, TRADE_BONDING_CURVE_INDEX, WITHDRAW_DISCRIMINATOR, WRAPPED_SOL_MINT,
};
use crate::feed::{CompiledInstruction, ConfirmedTransaction};
use crate::metrics::PipelineMetrics;
use crate::trade_event::TradeEvent;
use crate::types::ProgramKind;

/// Instruction kind decided by the 8-byte discriminator table. Anything not
/// in the table is `Unknown` and contributes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    Create,
    Buy,
    Sell,
    Deposit,
    Withdraw,
    CollectFee,
    Unknown,
}

pub fn instruction_kind(data: &[u8]) -> InstructionKind {
    if codec::discriminator_matches(data, &CREATE_DISCRIMINATOR) {
        InstructionKind::Create
    } else if codec::discriminator_matches(data, &BUY_DISCRIMINATOR) {
        InstructionKind::Buy
    } else if codec::discriminator_matches(data, &SELL_DISCRIMINATOR) {
        InstructionKind::Sell
    } else if codec::discriminator_matches(data, &DEPOSIT_DISCRIMINATOR) {
        InstructionKind::Deposit
    } else if codec::discriminator_matches(data, &WITHDRAW_DISCRIMINATOR) {
        InstructionKind::Withdraw
    } else if codec::discriminator_matches(data, &COLLECT_FEE_DISCRIMINATOR) {
        InstructionKind::CollectFee
    } else {
        InstructionKind::Unknown
    }
}

/// The canonical trade recovered from a transaction: the first decodable
/// program-data trade event, attributed to the watched program whose
/// instruction admitted it.
#[derive(Debug, Clone)]
pub struct PrimaryTrade {
    pub signature: String,
    pub slot: u64,
    pub block_time: Option<i64>,
    pub program: ProgramKind,
    pub event: TradeEvent,
    /// Bonding-curve account (curve trades) or pool account (AMM trades);
    /// None when the positional account was out of bounds
    pub venue: Option<Pubkey>,
    /// AMM swaps name the user positionally; curve trades carry it in the event
    pub user_wallet: Option<Pubkey>,
}

#[derive(Debug, Clone)]
pub struct TokenCreation {
    pub signature: String,
    pub slot: u64,
    pub block_time: Option<i64>,
    pub mint: Pubkey,
    pub creator: Pubkey,
    pub bonding_curve: Pubkey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiquidityKind {
    Deposit,
    Withdraw,
    CollectFee,
}

#[derive(Debug, Clone)]
pub struct LiquidityChange {
    pub signature: String,
    pub slot: u64,
    pub block_time: Option<i64>,
    pub kind: LiquidityKind,
    pub pool: Option<Pubkey>,
    pub user: Option<Pubkey>,
}

#[derive(Debug, Clone)]
pub enum ClassifiedEvent {
    BcCreate(TokenCreation),
    BcTrade(PrimaryTrade),
    AmmTrade(PrimaryTrade),
    AmmDeposit(LiquidityChange),
    AmmWithdraw(LiquidityChange),
    AmmFee(LiquidityChange),
}

impl ClassifiedEvent {
    /// Mint the event belongs to, where one is known. Liquidity events are
    /// keyed by pool and routed separately.
    pub fn mint(&self) -> Option<Pubkey> {
        match self {
            ClassifiedEvent::BcCreate(c) => Some(c.mint),
            ClassifiedEvent::BcTrade(t) | ClassifiedEvent::AmmTrade(t) => Some(t.event.mint),
            _ => None,
        }
    }

    pub fn signature(&self) -> &str {
        match self {
            ClassifiedEvent::BcCreate(c) => &c.signature,
            ClassifiedEvent::BcTrade(t) | ClassifiedEvent::AmmTrade(t) => &t.signature,
            ClassifiedEvent::AmmDeposit(l)
            | ClassifiedEvent::AmmWithdraw(l)
            | ClassifiedEvent::AmmFee(l) => &l.signature,
        }
    }
}

/// Walks confirmed transactions, matches the watched programs, and emits
/// typed events. Decode problems are logged and counted, never propagated;
/// the classifier always emits whatever it could recover.
pub struct TransactionClassifier {
    bonding_curve_program: Pubkey,
    amm_pool_program: Pubkey,
    metrics: PipelineMetrics,
}

impl TransactionClassifier {
    pub fn new(
        bonding_curve_program: Pubkey,
        amm_pool_program: Pubkey,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            bonding_curve_program,
            amm_pool_program,
            metrics,
        }
    }

    /// Whether any instruction targets a watched program. Drives the
    /// supervisor's parse-rate metric (parseable events over relevant
    /// transactions).
    pub fn touches_watched(&self, tx: &ConfirmedTransaction) -> bool {
        tx.message.instructions.iter().any(|ix| {
            tx.message
                .program_id(ix)
                .map(|p| *p == self.bonding_curve_program || *p == self.amm_pool_program)
                .unwrap_or(false)
        })
    }

    /// Classify one transaction. Failed and unwatched transactions yield
    /// nothing.
    pub fn classify(&self, tx: &ConfirmedTransaction) -> Vec<ClassifiedEvent> {
        self.metrics.transactions_seen.inc();

        if !tx.succeeded() {
            return Vec::new();
        }

        let mut events = Vec::new();
        let mut bc_trade_ix: Option<&CompiledInstruction> = None;
        let mut amm_trade_ix: Option<&CompiledInstruction> = None;
        let mut create_ix: Option<&CompiledInstruction> = None;
        let mut touched_watched = false;

        for ix in &tx.message.instructions {
            let Some(program_id) = tx.message.program_id(ix) else {
                continue;
            };

            if *program_id == self.bonding_curve_program {
                touched_watched = true;
                match instruction_kind(&ix.data) {
                    InstructionKind::Create => create_ix = create_ix.or(Some(ix)),
                    InstructionKind::Buy | InstructionKind::Sell => {
                        bc_trade_ix = bc_trade_ix.or(Some(ix));
                    }
                    _ => {}
                }
            } else if *program_id == self.amm_pool_program {
                touched_watched = true;
                match instruction_kind(&ix.data) {
                    InstructionKind::Buy | InstructionKind::Sell => {
                        amm_trade_ix = amm_trade_ix.or(Some(ix));
                    }
                    InstructionKind::Deposit => {
                        events.push(ClassifiedEvent::AmmDeposit(
                            self.liquidity_change(tx, ix, LiquidityKind::Deposit),
                        ));
                    }
                    InstructionKind::Withdraw => {
                        events.push(ClassifiedEvent::AmmWithdraw(
                            self.liquidity_change(tx, ix, LiquidityKind::Withdraw),
                        ));
                    }
                    InstructionKind::CollectFee => {
                        events.push(ClassifiedEvent::AmmFee(
                            self.liquidity_change(tx, ix, LiquidityKind::CollectFee),
                        ));
                    }
                    _ => {}
                }
            }
        }

        if !touched_watched {
            return Vec::new();
        }
        self.metrics.transactions_classified.inc();

        if let Some(creation) = self.detect_new_mint(tx, create_ix) {
            events.push(ClassifiedEvent::BcCreate(creation));
        }

        // One primary trade per signature per watched program: the first
        // decodable program-data event wins.
        if let Some(event) = self.first_trade_event(tx) {
            if let Some(ix) = bc_trade_ix {
                let venue = tx
                    .message
                    .instruction_account(ix, TRADE_BONDING_CURVE_INDEX)
                    .copied();
                if venue.is_none() {
                    self.metrics.partial_events.inc();
                }
                events.push(ClassifiedEvent::BcTrade(PrimaryTrade {
                    signature: tx.signature.clone(),
                    slot: tx.slot,
                    block_time: tx.block_time,
                    program: ProgramKind::BondingCurve,
                    event: event.clone(),
                    venue,
                    user_wallet: Some(event.user),
                }));
            } else if let Some(ix) = amm_trade_ix {
                let pool = tx.message.instruction_account(ix, AMM_POOL_INDEX).copied();
                let user = tx.message.instruction_account(ix, AMM_USER_INDEX).copied();
                if pool.is_none() || user.is_none() {
                    self.metrics.partial_events.inc();
                }
                events.push(ClassifiedEvent::AmmTrade(PrimaryTrade {
                    signature: tx.signature.clone(),
                    slot: tx.slot,
                    block_time: tx.block_time,
                    program: ProgramKind::AmmPool,
                    event,
                    venue: pool,
                    user_wallet: user,
                }));
            }
        }

        if !events.is_empty() {
            self.metrics.events_parsed.inc_by(events.len() as u64);
        }
        events
    }

    /// Scan meta logs for "Program data:" lines and return the first payload
    /// that decodes as a trade event. Wrong-length frames are skipped cheaply;
    /// real decode errors are counted.
    fn first_trade_event(&self, tx: &ConfirmedTransaction) -> Option<TradeEvent> {
        for line in &tx.meta.log_messages {
            let Some(payload) = line.strip_prefix(PROGRAM_DATA_PREFIX) else {
                continue;
            };
            let bytes = match codec::decode_program_data(payload) {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.metrics.decode_errors.inc();
                    debug!("bad program-data payload in {}: {e}", tx.signature);
                    continue;
                }
            };
            match TradeEvent::decode(&bytes) {
                Ok(Some(event)) => return Some(event),
                Ok(None) => continue,
                Err(e) => {
                    self.metrics.decode_errors.inc();
                    warn!(
                        "trade event decode failed in {} (data {}..): {e}",
                        tx.signature,
                        hex::encode(&bytes[..bytes.len().min(16)])
                    );
                }
            }
        }
        None
    }

    /// A transaction creates a token when token balances appear out of
    /// nowhere, the minted token is not wrapped SOL, and a bonding-curve
    /// `create` instruction is present with a usable curve account.
    fn detect_new_mint(
        &self,
        tx: &ConfirmedTransaction,
        create_ix: Option<&CompiledInstruction>,
    ) -> Option<TokenCreation> {
        let create_ix = create_ix?;
        if tx.meta.post_token_balances.is_empty() || !tx.meta.pre_token_balances.is_empty() {
            return None;
        }

        let minted = &tx.meta.post_token_balances[0].mint;
        if minted == WRAPPED_SOL_MINT {
            return None;
        }
        let mint = match codec::decode_base58_key(minted) {
            Ok(key) => key,
            Err(e) => {
                self.metrics.decode_errors.inc();
                debug!("unparseable mint in token balances of {}: {e}", tx.signature);
                return None;
            }
        };

        let bonding_curve = tx
            .message
            .instruction_account(create_ix, CREATE_BONDING_CURVE_INDEX)
            .copied();
        let bonding_curve = match bonding_curve {
            Some(key) if plausible_curve_account(&key) => key,
            _ => {
                // Storing an unusable curve reference is worse than storing
                // none; reject the creation outright.
                self.metrics.partial_events.inc();
                debug!("rejecting creation in {}: implausible curve account", tx.signature);
                return None;
            }
        };

        let creator = tx.message.account_keys.first().copied()?;

        Some(TokenCreation {
            signature: tx.signature.clone(),
            slot: tx.slot,
            block_time: tx.block_time,
            mint,
            creator,
            bonding_curve,
        })
    }

    fn liquidity_change(
        &self,
        tx: &ConfirmedTransaction,
        ix: &CompiledInstruction,
        kind: LiquidityKind,
    ) -> LiquidityChange {
        let pool = tx.message.instruction_account(ix, AMM_POOL_INDEX).copied();
        let user = tx.message.instruction_account(ix, AMM_USER_INDEX).copied();
        if pool.is_none() {
            self.metrics.partial_events.inc();
        }
        LiquidityChange {
            signature: tx.signature.clone(),
            slot: tx.slot,
            block_time: tx.block_time,
            kind,
            pool,
            user,
        }
    }
}

/// A curve account reference is kept only if it is a real, non-program key.
/// (Equivalent to the length-44 base58 check on string-typed feeds: the key
/// must decode to 32 bytes and not alias a system account.)
fn plausible_curve_account(key: &Pubkey) -> bool {
    *key != Pubkey::default() && *key != system_program::ID && *key != spl_token::ID
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{TokenBalance, TransactionMessage, TransactionMeta};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    fn classifier() -> (TransactionClassifier, Pubkey, Pubkey) {
        let bc = Pubkey::new_unique();
        let amm = Pubkey::new_unique();
        (
            TransactionClassifier::new(bc, amm, PipelineMetrics::new()),
            bc,
            amm,
        )
    }

    fn trade_event(mint: Pubkey, is_buy: bool) -> TradeEvent {
        TradeEvent {
            mint,
            sol_amount: 1_000_000_000,
            token_amount: 35_000_000_000_000,
            is_buy,
            user: Pubkey::new_unique(),
            virtual_token_reserves: 1_073_000_000_000_000,
            virtual_sol_reserves: 30_000_000_000,
            real_token_reserves: 793_100_000_000_000,
            real_sol_reserves: 5_000_000_000,
        }
    }

    fn program_data_log(event: &TradeEvent) -> String {
        format!("{PROGRAM_DATA_PREFIX}{}", BASE64.encode(event.encode()))
    }

    /// Transaction with one instruction against `program` using `disc`,
    /// with enough accounts that positional lookups succeed.
    fn tx_with_instruction(
        program: Pubkey,
        disc: [u8; 8],
        logs: Vec<String>,
    ) -> ConfirmedTransaction {
        let keys: Vec<Pubkey> = (0..6).map(|_| Pubkey::new_unique()).collect();
        let mut account_keys = keys.clone();
        account_keys.push(program);
        ConfirmedTransaction {
            signature: format!("sig-{}", Pubkey::new_unique()),
            slot: 1000,
            block_time: Some(1_700_000_000),
            message: TransactionMessage {
                account_keys,
                instructions: vec![CompiledInstruction {
                    program_id_index: 6,
                    accounts: vec![0, 1, 2, 3, 4, 5],
                    data: disc.to_vec(),
                }],
            },
            meta: TransactionMeta {
                err: None,
                log_messages: logs,
                pre_token_balances: vec![],
                post_token_balances: vec![],
            },
        }
    }

    #[test]
    fn test_bc_buy_classifies_as_bc_trade() {
        let (classifier, bc, _) = classifier();
        let event = trade_event(Pubkey::new_unique(), true);
        let tx = tx_with_instruction(bc, BUY_DISCRIMINATOR, vec![program_data_log(&event)]);

        let events = classifier.classify(&tx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ClassifiedEvent::BcTrade(trade) => {
                assert_eq!(trade.program, ProgramKind::BondingCurve);
                assert_eq!(trade.event, event);
                // buy/sell convention puts the curve at account index 3
                assert_eq!(trade.venue, Some(tx.message.account_keys[3]));
            }
            other => panic!("expected BcTrade, got {other:?}"),
        }
    }

    #[test]
    fn test_amm_swap_classifies_as_amm_trade() {
        let (classifier, _, amm) = classifier();
        let event = trade_event(Pubkey::new_unique(), false);
        let tx = tx_with_instruction(amm, SELL_DISCRIMINATOR, vec![program_data_log(&event)]);

        let events = classifier.classify(&tx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ClassifiedEvent::AmmTrade(trade) => {
                assert_eq!(trade.program, ProgramKind::AmmPool);
                assert_eq!(trade.venue, Some(tx.message.account_keys[0]));
                assert_eq!(trade.user_wallet, Some(tx.message.account_keys[1]));
            }
            other => panic!("expected AmmTrade, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_transaction_is_skipped() {
        let (classifier, bc, _) = classifier();
        let event = trade_event(Pubkey::new_unique(), true);
        let mut tx = tx_with_instruction(bc, BUY_DISCRIMINATOR, vec![program_data_log(&event)]);
        tx.meta.err = Some("InstructionError(0)".to_string());
        assert!(classifier.classify(&tx).is_empty());
    }

    #[test]
    fn test_unwatched_program_yields_nothing() {
        let (classifier, _, _) = classifier();
        let event = trade_event(Pubkey::new_unique(), true);
        let tx = tx_with_instruction(
            Pubkey::new_unique(),
            BUY_DISCRIMINATOR,
            vec![program_data_log(&event)],
        );
        assert!(classifier.classify(&tx).is_empty());
    }

    #[test]
    fn test_unknown_discriminator_contributes_nothing() {
        let (classifier, bc, _) = classifier();
        let tx = tx_with_instruction(bc, [9u8; 8], vec![]);
        assert!(classifier.classify(&tx).is_empty());
        assert_eq!(instruction_kind(&[9u8; 8]), InstructionKind::Unknown);
    }

    #[test]
    fn test_wrong_length_program_data_yields_no_trade() {
        let (classifier, bc, _) = classifier();
        let short = BASE64.encode(vec![0u8; 224]);
        let long = BASE64.encode(vec![0u8; 226]);
        let tx = tx_with_instruction(
            bc,
            BUY_DISCRIMINATOR,
            vec![
                format!("{PROGRAM_DATA_PREFIX}{short}"),
                format!("{PROGRAM_DATA_PREFIX}{long}"),
            ],
        );
        assert!(classifier.classify(&tx).is_empty());
    }

    #[test]
    fn test_first_program_data_event_is_canonical() {
        let (classifier, bc, _) = classifier();
        let first = trade_event(Pubkey::new_unique(), true);
        let second = trade_event(Pubkey::new_unique(), false);
        let tx = tx_with_instruction(
            bc,
            BUY_DISCRIMINATOR,
            vec![program_data_log(&first), program_data_log(&second)],
        );

        let events = classifier.classify(&tx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ClassifiedEvent::BcTrade(trade) => assert_eq!(trade.event, first),
            other => panic!("expected BcTrade, got {other:?}"),
        }
    }

    #[test]
    fn test_amm_liquidity_events() {
        let (classifier, _, amm) = classifier();
        for (disc, expect_deposit) in [(DEPOSIT_DISCRIMINATOR, true), (WITHDRAW_DISCRIMINATOR, false)] {
            let tx = tx_with_instruction(amm, disc, vec![]);
            let events = classifier.classify(&tx);
            assert_eq!(events.len(), 1);
            match &events[0] {
                ClassifiedEvent::AmmDeposit(l) => {
                    assert!(expect_deposit);
                    assert_eq!(l.kind, LiquidityKind::Deposit);
                    assert!(l.pool.is_some());
                }
                ClassifiedEvent::AmmWithdraw(l) => {
                    assert!(!expect_deposit);
                    assert_eq!(l.kind, LiquidityKind::Withdraw);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    fn creation_tx(bc: Pubkey, curve_at_index_2: Pubkey, mint: Pubkey) -> ConfirmedTransaction {
        let creator = Pubkey::new_unique();
        let account_keys = vec![
            creator,
            Pubkey::new_unique(),
            curve_at_index_2,
            Pubkey::new_unique(),
            bc,
        ];
        ConfirmedTransaction {
            signature: "create-sig".to_string(),
            slot: 500,
            block_time: Some(1_700_000_100),
            message: TransactionMessage {
                account_keys,
                instructions: vec![CompiledInstruction {
                    program_id_index: 4,
                    accounts: vec![0, 1, 2, 3],
                    data: CREATE_DISCRIMINATOR.to_vec(),
                }],
            },
            meta: TransactionMeta {
                err: None,
                log_messages: vec![],
                pre_token_balances: vec![],
                post_token_balances: vec![TokenBalance {
                    mint: mint.to_string(),
                    owner: creator.to_string(),
                    amount: 0,
                }],
            },
        }
    }

    #[test]
    fn test_new_mint_detection() {
        let (classifier, bc, _) = classifier();
        let curve = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let tx = creation_tx(bc, curve, mint);

        let events = classifier.classify(&tx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ClassifiedEvent::BcCreate(c) => {
                assert_eq!(c.mint, mint);
                assert_eq!(c.bonding_curve, curve);
                assert_eq!(c.creator, tx.message.account_keys[0]);
            }
            other => panic!("expected BcCreate, got {other:?}"),
        }
    }

    #[test]
    fn test_creation_rejected_when_curve_is_system_program() {
        let (classifier, bc, _) = classifier();
        let tx = creation_tx(bc, system_program::ID, Pubkey::new_unique());
        assert!(classifier.classify(&tx).is_empty());
    }

    #[test]
    fn test_creation_rejected_for_wrapped_sol() {
        let (classifier, bc, _) = classifier();
        let mut tx = creation_tx(bc, Pubkey::new_unique(), Pubkey::new_unique());
        tx.meta.post_token_balances[0].mint = WRAPPED_SOL_MINT.to_string();
        assert!(classifier.classify(&tx).is_empty());
    }

    #[test]
    fn test_creation_rejected_when_pre_balances_exist() {
        let (classifier, bc, _) = classifier();
        let mut tx = creation_tx(bc, Pubkey::new_unique(), Pubkey::new_unique());
        tx.meta.pre_token_balances = tx.meta.post_token_balances.clone();
        assert!(classifier.classify(&tx).is_empty());
    }
}
