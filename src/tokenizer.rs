//! Tokenizer for text encoding and decoding
//!
//! A unified BPE tokenizer built from GGUF metadata, covering the two
//! vocabulary families the supported models ship with:
//!
//! - **SentencePiece** (`tokenizer.ggml.model = "llama"`): U+2581 word
//!   boundary marker, score-based merges, `<0xNN>` byte fallback
//! - **GPT-2** (`tokenizer.ggml.model = "gpt2"`): byte-level symbols,
//!   rank-based merges, reversible printable-byte mapping on decode
//!
//! The mode is selected from the metadata model key alone; a merges table
//! without that key does not switch the tokenizer to GPT-2.
//!
//! Control tokens longer than two bytes are matched as whole units before
//! BPE and never merge with surrounding text.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{HablarError, Result};
use crate::gguf::GgufFile;

/// Token type tag: ordinary vocabulary entry
pub const TOKEN_TYPE_NORMAL: i32 = 1;
/// Token type tag: unknown (`<unk>`)
pub const TOKEN_TYPE_UNKNOWN: i32 = 2;
/// Token type tag: control (`<s>`, `</s>`, chat markers)
pub const TOKEN_TYPE_CONTROL: i32 = 3;
/// Token type tag: byte fallback (`<0x00>`..`<0xFF>`)
pub const TOKEN_TYPE_BYTE: i32 = 6;

/// SentencePiece word-boundary marker
const SPACE_MARKER: char = '\u{2581}';

/// Merge strategy, detected from `tokenizer.ggml.model`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerMode {
    /// Score-based merging with U+2581 space marker
    SentencePiece,
    /// Rank-based merging over byte-level symbols
    Gpt2,
}

/// Map a GPT-2 printable-mapped character back to its raw byte.
///
/// Bytes 33-126, 161-172, and 174-255 map to themselves; the remaining
/// 68 bytes map, in order, to codepoints 256..=323.
#[inline]
#[must_use]
pub fn gpt2_unicode_to_byte(c: char) -> Option<u8> {
    let cp = c as u32;
    if (0x0100..=0x0143).contains(&cp) {
        #[allow(clippy::cast_possible_truncation)]
        let offset = (cp - 0x0100) as u8;
        // Non-printable bytes in ascending order: 0x00-0x20, 0x7F,
        // 0x80-0xA0, 0xAD.
        let byte = if offset <= 32 {
            offset
        } else if offset == 33 {
            0x7F
        } else if offset <= 66 {
            0x80 + (offset - 34)
        } else {
            0xAD
        };
        Some(byte)
    } else if cp <= 0xFF {
        #[allow(clippy::cast_possible_truncation)]
        Some(cp as u8)
    } else {
        None
    }
}

/// Reverse the GPT-2 printable-byte mapping for a whole token piece.
///
/// Unknown runes pass through as their UTF-8 bytes.
fn gpt2_decode_piece(piece: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(piece.len());
    for c in piece.chars() {
        if let Some(b) = gpt2_unicode_to_byte(c) {
            bytes.push(b);
        } else {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    bytes
}

/// Is this piece an exact `<0xNN>` byte-fallback spelling?
fn parse_byte_token(piece: &str) -> Option<u8> {
    let bytes = piece.as_bytes();
    if bytes.len() == 6 && bytes[0] == b'<' && bytes[1] == b'0' && bytes[2] == b'x' && bytes[5] == b'>'
    {
        u8::from_str_radix(&piece[3..5], 16).ok()
    } else {
        None
    }
}

/// BPE tokenizer assembled from GGUF metadata
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: Vec<String>,
    scores: Vec<f32>,
    types: Vec<i32>,
    mode: TokenizerMode,
    /// BOS token id, -1 when absent
    pub bos_id: i64,
    /// EOS token id, -1 when absent
    pub eos_id: i64,
    /// Whether encode prepends BOS by default
    pub add_bos_token: bool,
    add_space_prefix: bool,
    token_to_id: HashMap<String, u32>,
    /// Byte value -> byte-fallback token id, -1 when the vocab lacks it
    byte_tokens: [i32; 256],
    /// GPT-2 merge priority: "A B" -> rank (lower merges first)
    merge_rank: HashMap<String, u32>,
    /// Control tokens matched as whole units before BPE
    special_tokens: HashMap<String, u32>,
}

impl Tokenizer {
    /// Build a tokenizer from container metadata
    ///
    /// # Errors
    ///
    /// Returns `InvalidVocabulary` when the token list is missing, when
    /// SentencePiece scores are absent, or when GPT-2 merges are absent.
    pub fn from_gguf(file: &GgufFile) -> Result<Self> {
        let vocab = file.token_list().ok_or_else(|| HablarError::InvalidVocabulary {
            reason: "missing tokenizer.ggml.tokens".to_string(),
        })?;

        let mode = match file.tokenizer_model() {
            Some("gpt2") => TokenizerMode::Gpt2,
            _ => TokenizerMode::SentencePiece,
        };

        let scores = file.token_scores().unwrap_or_default();
        if mode == TokenizerMode::SentencePiece && scores.is_empty() {
            return Err(HablarError::InvalidVocabulary {
                reason: "SentencePiece vocabulary has no tokenizer.ggml.scores".to_string(),
            });
        }

        let mut merge_rank = HashMap::new();
        if mode == TokenizerMode::Gpt2 {
            let merges = file.token_merges().ok_or_else(|| HablarError::InvalidVocabulary {
                reason: "GPT-2 vocabulary has no tokenizer.ggml.merges".to_string(),
            })?;
            merge_rank.reserve(merges.len());
            for (rank, merge) in merges.into_iter().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                merge_rank.insert(merge, rank as u32);
            }
        }

        let types = file.token_types().unwrap_or_default();
        let bos_id = file.bos_token_id().unwrap_or(-1);
        let eos_id = file.eos_token_id().unwrap_or(-1);

        let mut token_to_id = HashMap::with_capacity(vocab.len());
        for (id, token) in vocab.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            token_to_id.insert(token.clone(), id as u32);
        }

        let mut byte_tokens = [-1i32; 256];
        for (b, slot) in byte_tokens.iter_mut().enumerate() {
            let name = format!("<0x{b:02X}>");
            if let Some(&id) = token_to_id.get(&name) {
                #[allow(clippy::cast_possible_wrap)]
                {
                    *slot = id as i32;
                }
            }
        }

        // Control tokens of more than two bytes are matched whole; the
        // short ones (single markers) go through ordinary lookup.
        let mut special_tokens = HashMap::new();
        for (id, &typ) in types.iter().enumerate() {
            if typ == TOKEN_TYPE_CONTROL && id < vocab.len() && vocab[id].len() > 2 {
                #[allow(clippy::cast_possible_truncation)]
                special_tokens.insert(vocab[id].clone(), id as u32);
            }
        }

        let add_space_prefix = match mode {
            TokenizerMode::Gpt2 => false,
            TokenizerMode::SentencePiece => file.add_space_prefix().unwrap_or(true),
        };
        let add_bos_token = file.add_bos_token().unwrap_or(bos_id >= 0);

        debug!(
            vocab = vocab.len(),
            specials = special_tokens.len(),
            ?mode,
            bos = bos_id,
            eos = eos_id,
            "tokenizer ready"
        );

        Ok(Self {
            vocab,
            scores,
            types,
            mode,
            bos_id,
            eos_id,
            add_bos_token,
            add_space_prefix,
            token_to_id,
            byte_tokens,
            merge_rank,
            special_tokens,
        })
    }

    /// Vocabulary size
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Active merge strategy
    #[must_use]
    pub fn mode(&self) -> TokenizerMode {
        self.mode
    }

    /// Token string for an id, if in range
    #[must_use]
    pub fn token(&self, id: u32) -> Option<&str> {
        self.vocab.get(id as usize).map(String::as_str)
    }

    /// Id for an exact token string
    #[must_use]
    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// Resolve a special token by bare name, trying `name`, `<|name|>`,
    /// and `<name>` spellings.
    #[must_use]
    pub fn find_special_token(&self, name: &str) -> Option<u32> {
        for candidate in [name.to_string(), format!("<|{name}|>"), format!("<{name}>")] {
            if let Some(&id) = self.token_to_id.get(&candidate) {
                return Some(id);
            }
        }
        None
    }

    // ------------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------------

    /// Encode text to token ids. Never fails: unmapped content falls back
    /// to byte tokens, and bytes without a fallback entry are dropped.
    #[must_use]
    pub fn encode(&self, text: &str, add_bos: bool) -> Vec<u32> {
        let mut ids = Vec::new();
        if add_bos && self.bos_id >= 0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            ids.push(self.bos_id as u32);
        }
        if text.is_empty() {
            return ids;
        }

        for (is_special, segment) in self.split_on_special_tokens(text) {
            if is_special {
                if let Some(&id) = self.special_tokens.get(segment) {
                    ids.push(id);
                }
            } else {
                match self.mode {
                    TokenizerMode::SentencePiece => self.encode_sentencepiece(segment, &mut ids),
                    TokenizerMode::Gpt2 => self.encode_gpt2(segment, &mut ids),
                }
            }
        }

        ids
    }

    /// Split text into (is_special, segment) runs, matching the earliest
    /// special token first and the longest on position ties.
    fn split_on_special_tokens<'a>(&self, text: &'a str) -> Vec<(bool, &'a str)> {
        if self.special_tokens.is_empty() {
            return vec![(false, text)];
        }

        let mut segments = Vec::new();
        let mut remaining = text;

        while !remaining.is_empty() {
            let mut best: Option<(usize, &str)> = None;
            for token in self.special_tokens.keys() {
                if let Some(pos) = remaining.find(token.as_str()) {
                    let better = match best {
                        None => true,
                        Some((best_pos, best_tok)) => {
                            pos < best_pos || (pos == best_pos && token.len() > best_tok.len())
                        },
                    };
                    if better {
                        best = Some((pos, token.as_str()));
                    }
                }
            }

            match best {
                Some((pos, token)) => {
                    if pos > 0 {
                        segments.push((false, &remaining[..pos]));
                    }
                    // Reborrow out of the map key so the segment points into `text`
                    segments.push((true, &remaining[pos..pos + token.len()]));
                    remaining = &remaining[pos + token.len()..];
                },
                None => {
                    segments.push((false, remaining));
                    break;
                },
            }
        }

        segments
    }

    fn encode_sentencepiece(&self, text: &str, ids: &mut Vec<u32>) {
        let prefixed = if self.add_space_prefix && !text.starts_with(' ') {
            format!(" {text}")
        } else {
            text.to_string()
        };
        let marked = prefixed.replace(' ', "\u{2581}");

        let mut symbols = self.initial_symbols_sentencepiece(&marked);
        self.merge_by_score(&mut symbols);
        self.symbols_to_ids(&symbols, ids);
    }

    fn encode_gpt2(&self, text: &str, ids: &mut Vec<u32>) {
        let mut symbols: Vec<String> = Vec::with_capacity(text.len());
        for &b in text.as_bytes() {
            let single = std::str::from_utf8(std::slice::from_ref(&b))
                .ok()
                .filter(|s| self.token_to_id.contains_key(*s));
            match single {
                Some(s) => symbols.push(s.to_string()),
                None => symbols.push(format!("<0x{b:02X}>")),
            }
        }

        self.merge_by_rank(&mut symbols);
        self.symbols_to_ids(&symbols, ids);
    }

    /// Initial SentencePiece symbols: one per codepoint when the
    /// codepoint is in the vocabulary, otherwise one `<0xNN>` per UTF-8
    /// byte of that codepoint.
    fn initial_symbols_sentencepiece(&self, text: &str) -> Vec<String> {
        let mut symbols = Vec::new();
        for c in text.chars() {
            let mut buf = [0u8; 4];
            let s = c.encode_utf8(&mut buf);
            if self.token_to_id.contains_key(s) {
                symbols.push(s.to_string());
            } else {
                for &b in s.as_bytes() {
                    symbols.push(format!("<0x{b:02X}>"));
                }
            }
        }
        symbols
    }

    /// Merge the adjacent pair whose concatenation scores highest, until
    /// no pair concatenates to a scored vocabulary entry. Ties resolve to
    /// the earliest index.
    fn merge_by_score(&self, symbols: &mut Vec<String>) {
        loop {
            let mut best_score = f32::NEG_INFINITY;
            let mut best_idx = None;

            for i in 0..symbols.len().saturating_sub(1) {
                let merged = format!("{}{}", symbols[i], symbols[i + 1]);
                if let Some(&id) = self.token_to_id.get(&merged) {
                    if let Some(&score) = self.scores.get(id as usize) {
                        if score > best_score {
                            best_score = score;
                            best_idx = Some(i);
                        }
                    }
                }
            }

            let Some(i) = best_idx else { break };
            let merged = format!("{}{}", symbols[i], symbols[i + 1]);
            symbols[i] = merged;
            symbols.remove(i + 1);
        }
    }

    /// Merge the adjacent pair with the lowest merge rank, until no pair
    /// appears in the merge table. Ties resolve to the earliest index.
    fn merge_by_rank(&self, symbols: &mut Vec<String>) {
        loop {
            let mut best_rank = u32::MAX;
            let mut best_idx = None;

            for i in 0..symbols.len().saturating_sub(1) {
                let pair = format!("{} {}", symbols[i], symbols[i + 1]);
                if let Some(&rank) = self.merge_rank.get(&pair) {
                    if rank < best_rank {
                        best_rank = rank;
                        best_idx = Some(i);
                    }
                }
            }

            let Some(i) = best_idx else { break };
            let merged = format!("{}{}", symbols[i], symbols[i + 1]);
            symbols[i] = merged;
            symbols.remove(i + 1);
        }
    }

    fn symbols_to_ids(&self, symbols: &[String], ids: &mut Vec<u32>) {
        for sym in symbols {
            if let Some(&id) = self.token_to_id.get(sym) {
                ids.push(id);
            } else {
                for &b in sym.as_bytes() {
                    let fallback = self.byte_tokens[b as usize];
                    if fallback >= 0 {
                        #[allow(clippy::cast_sign_loss)]
                        ids.push(fallback as u32);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Decoding
    // ------------------------------------------------------------------------

    /// Decode a token sequence to text.
    ///
    /// Control tokens and out-of-range ids are skipped; the synthetic
    /// leading space from encoding is stripped.
    #[must_use]
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::new();

        for &id in ids {
            if id as usize >= self.vocab.len() {
                continue;
            }
            if self.is_control(id) {
                continue;
            }
            bytes.extend_from_slice(&self.piece_bytes(&self.vocab[id as usize]));
        }

        let mut result = String::from_utf8_lossy(&bytes).into_owned();
        if self.add_space_prefix && result.starts_with(' ') {
            result.remove(0);
        }
        result
    }

    /// Decode a single token id to its raw bytes.
    ///
    /// The result may be a partial UTF-8 sequence (byte-fallback tokens);
    /// callers accumulate bytes and finalize once.
    #[must_use]
    pub fn decode_token(&self, id: u32) -> Vec<u8> {
        match self.vocab.get(id as usize) {
            Some(piece) => self.piece_bytes(piece),
            None => Vec::new(),
        }
    }

    fn piece_bytes(&self, piece: &str) -> Vec<u8> {
        if let Some(b) = parse_byte_token(piece) {
            return vec![b];
        }
        match self.mode {
            TokenizerMode::Gpt2 => gpt2_decode_piece(piece),
            TokenizerMode::SentencePiece => {
                piece.replace(SPACE_MARKER, " ").into_bytes()
            },
        }
    }

    fn is_control(&self, id: u32) -> bool {
        self.types.get(id as usize).copied() == Some(TOKEN_TYPE_CONTROL)
    }
}
