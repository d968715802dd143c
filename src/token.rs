use rand::{distributions::Alphanumeric, thread_rng, Rng};

///
/// Length of ownership tokens, `A-Za-z0-9` over 21 characters.
///
pub const TOKEN_LEN: usize = 21;

pub const SHORT_TOKEN_LEN: usize = 16;

///
/// Produces the values stored under a lock key to prove ownership.
///
/// Tokens must be unique enough that two acquisitions never share one.
///
pub trait TokenGenerator: Send + Sync + 'static {
    fn generate(&self) -> String;
}

///
/// Random alphanumeric tokens of a fixed length.
///
#[derive(Debug, Clone, Copy)]
pub struct AlphanumericTokens {
    len: usize,
}

impl AlphanumericTokens {
    pub fn new(len: usize) -> Self {
        Self { len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for AlphanumericTokens {
    fn default() -> Self {
        Self::new(TOKEN_LEN)
    }
}

impl TokenGenerator for AlphanumericTokens {
    fn generate(&self) -> String {
        random_alphanumeric(self.len)
    }
}

impl<F> TokenGenerator for F
where
    F: Fn() -> String + Send + Sync + 'static,
{
    fn generate(&self) -> String {
        self()
    }
}

fn random_alphanumeric(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn gen_id() -> String {
    random_alphanumeric(TOKEN_LEN)
}

pub fn gen_short_id() -> String {
    random_alphanumeric(SHORT_TOKEN_LEN)
}
