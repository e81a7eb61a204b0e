use router_tree::TokenId;

/// A pure, deterministic `text -> token ids` function. The real
/// tokenizer is an external collaborator; this trait is the seam it
/// plugs into.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<TokenId>;
}

/// A byte-level stand-in tokenizer, used where no real tokenizer has
/// been wired in (tests, local development). One token id per UTF-8
/// byte: deterministic, dependency-free, and enough to exercise prefix
/// affinity end to end.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        text.bytes().map(TokenId::from).collect()
    }
}
