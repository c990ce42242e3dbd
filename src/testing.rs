//! Test doubles for the node gateway and the hasher.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::chain::{BlockHash, NodeRpc, RpcError, SubmitOutcome, TemplateId, WorkTemplate};
use crate::miner::hasher::{PowHasher, HEADER_SIZE};
use crate::miner::Candidate;

fn header_nonce(header: &[u8; HEADER_SIZE]) -> u32 {
    u32::from_le_bytes([header[76], header[77], header[78], header[79]])
}

/// Hasher whose output depends only on the header nonce.
///
/// The winning nonce hashes to zero, which meets every target; every other
/// nonce hashes to all ones, which meets none short of the maximum.
#[derive(Debug, Clone, Default)]
pub struct ScriptedHasher {
    winning_nonce: Option<u32>,
    panic_nonce: Option<u32>,
    delay: Option<Duration>,
}

impl ScriptedHasher {
    pub fn never() -> Self {
        Self::default()
    }

    pub fn winning_at(nonce: u32) -> Self {
        Self {
            winning_nonce: Some(nonce),
            ..Self::default()
        }
    }

    pub fn panicking_at(mut self, nonce: u32) -> Self {
        self.panic_nonce = Some(nonce);
        self
    }

    /// Sleep on every hash to stretch rounds out in wall-clock time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl PowHasher for ScriptedHasher {
    fn hash_header(&self, header: &[u8; HEADER_SIZE]) -> [u8; 32] {
        let nonce = header_nonce(header);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.panic_nonce == Some(nonce) {
            panic!("scripted hasher panic at nonce {nonce}");
        }
        if self.winning_nonce == Some(nonce) {
            [0; 32]
        } else {
            [0xff; 32]
        }
    }
}

pub fn template_on(prev_hash: BlockHash) -> WorkTemplate {
    let mut template = WorkTemplate::benchmark().unwrap();
    template.id.prev_hash = prev_hash;
    template
}

pub fn hash(byte: u8) -> BlockHash {
    BlockHash::from_display_bytes([byte; 32])
}

/// Scriptable in-memory node.
pub struct MockNode {
    tip: Mutex<BlockHash>,
    template_results: Mutex<VecDeque<Result<WorkTemplate, RpcError>>>,
    tip_results: Mutex<VecDeque<Result<BlockHash, RpcError>>>,
    submit_results: Mutex<VecDeque<Result<SubmitOutcome, RpcError>>>,
    submissions: Mutex<Vec<(TemplateId, Candidate)>>,
    tip_delay: Mutex<Option<Duration>>,
    template_calls: AtomicUsize,
    tip_calls: AtomicUsize,
    submit_calls: AtomicUsize,
}

impl MockNode {
    pub fn new(tip: BlockHash) -> Self {
        Self {
            tip: Mutex::new(tip),
            template_results: Mutex::new(VecDeque::new()),
            tip_results: Mutex::new(VecDeque::new()),
            submit_results: Mutex::new(VecDeque::new()),
            submissions: Mutex::new(Vec::new()),
            tip_delay: Mutex::new(None),
            template_calls: AtomicUsize::new(0),
            tip_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
        }
    }

    /// Move the tip; later templates build on it.
    pub fn set_tip(&self, tip: BlockHash) {
        *self.tip.lock().unwrap() = tip;
    }

    pub fn push_template_result(&self, result: Result<WorkTemplate, RpcError>) {
        self.template_results.lock().unwrap().push_back(result);
    }

    pub fn push_tip_result(&self, result: Result<BlockHash, RpcError>) {
        self.tip_results.lock().unwrap().push_back(result);
    }

    pub fn push_submit_result(&self, result: Result<SubmitOutcome, RpcError>) {
        self.submit_results.lock().unwrap().push_back(result);
    }

    /// Make every tip poll hang for `delay` before answering.
    pub fn set_tip_delay(&self, delay: Duration) {
        *self.tip_delay.lock().unwrap() = Some(delay);
    }

    pub fn template_calls(&self) -> usize {
        self.template_calls.load(Ordering::SeqCst)
    }

    pub fn tip_calls(&self) -> usize {
        self.tip_calls.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> Vec<(TemplateId, Candidate)> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeRpc for MockNode {
    async fn get_template(&self) -> Result<WorkTemplate, RpcError> {
        self.template_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.template_results.lock().unwrap().pop_front() {
            return result;
        }
        Ok(template_on(*self.tip.lock().unwrap()))
    }

    async fn get_tip_hash(&self) -> Result<BlockHash, RpcError> {
        self.tip_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.tip_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(result) = self.tip_results.lock().unwrap().pop_front() {
            return result;
        }
        Ok(*self.tip.lock().unwrap())
    }

    async fn submit_block(
        &self,
        template: &WorkTemplate,
        candidate: &Candidate,
    ) -> Result<SubmitOutcome, RpcError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let result = self
            .submit_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(SubmitOutcome::Accepted));
        if result.is_ok() {
            self.submissions
                .lock()
                .unwrap()
                .push((template.id, candidate.clone()));
        }
        result
    }
}
