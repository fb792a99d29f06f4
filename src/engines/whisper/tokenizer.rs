//! Byte-level BPE tokenizer for Whisper (decode-oriented).
//!
//! Loads the HuggingFace-layout `tokenizer.json` (`model.vocab` plus
//! `added_tokens`), resolves the special marker tokens by name, and exposes
//! the language table, the derived non-speech token set, and start-of-
//! transcript sequence construction.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::decoding::Task;
use super::model::WhisperError;

/// Language codes paired with their English names, in Whisper's canonical
/// order (the order determines each language's marker-token position).
pub const LANGUAGES: &[(&str, &str)] = &[
    ("en", "english"),
    ("zh", "chinese"),
    ("de", "german"),
    ("es", "spanish"),
    ("ru", "russian"),
    ("ko", "korean"),
    ("fr", "french"),
    ("ja", "japanese"),
    ("pt", "portuguese"),
    ("tr", "turkish"),
    ("pl", "polish"),
    ("ca", "catalan"),
    ("nl", "dutch"),
    ("ar", "arabic"),
    ("sv", "swedish"),
    ("it", "italian"),
    ("id", "indonesian"),
    ("hi", "hindi"),
    ("fi", "finnish"),
    ("vi", "vietnamese"),
    ("he", "hebrew"),
    ("uk", "ukrainian"),
    ("el", "greek"),
    ("ms", "malay"),
    ("cs", "czech"),
    ("ro", "romanian"),
    ("da", "danish"),
    ("hu", "hungarian"),
    ("ta", "tamil"),
    ("no", "norwegian"),
    ("th", "thai"),
    ("ur", "urdu"),
    ("hr", "croatian"),
    ("bg", "bulgarian"),
    ("lt", "lithuanian"),
    ("la", "latin"),
    ("mi", "maori"),
    ("ml", "malayalam"),
    ("cy", "welsh"),
    ("sk", "slovak"),
    ("te", "telugu"),
    ("fa", "persian"),
    ("lv", "latvian"),
    ("bn", "bengali"),
    ("sr", "serbian"),
    ("az", "azerbaijani"),
    ("sl", "slovenian"),
    ("kn", "kannada"),
    ("et", "estonian"),
    ("mk", "macedonian"),
    ("br", "breton"),
    ("eu", "basque"),
    ("is", "icelandic"),
    ("hy", "armenian"),
    ("ne", "nepali"),
    ("mn", "mongolian"),
    ("bs", "bosnian"),
    ("kk", "kazakh"),
    ("sq", "albanian"),
    ("sw", "swahili"),
    ("gl", "galician"),
    ("mr", "marathi"),
    ("pa", "punjabi"),
    ("si", "sinhala"),
    ("km", "khmer"),
    ("sn", "shona"),
    ("yo", "yoruba"),
    ("so", "somali"),
    ("af", "afrikaans"),
    ("oc", "occitan"),
    ("ka", "georgian"),
    ("be", "belarusian"),
    ("tg", "tajik"),
    ("sd", "sindhi"),
    ("gu", "gujarati"),
    ("am", "amharic"),
    ("yi", "yiddish"),
    ("lo", "lao"),
    ("uz", "uzbek"),
    ("fo", "faroese"),
    ("ht", "haitian creole"),
    ("ps", "pashto"),
    ("tk", "turkmen"),
    ("nn", "nynorsk"),
    ("mt", "maltese"),
    ("sa", "sanskrit"),
    ("lb", "luxembourgish"),
    ("my", "myanmar"),
    ("bo", "tibetan"),
    ("tl", "tagalog"),
    ("mg", "malagasy"),
    ("as", "assamese"),
    ("tt", "tatar"),
    ("haw", "hawaiian"),
    ("ln", "lingala"),
    ("ha", "hausa"),
    ("ba", "bashkir"),
    ("jw", "javanese"),
    ("su", "sundanese"),
];

/// Alternative language names accepted in addition to the canonical table.
const LANGUAGE_ALIASES: &[(&str, &str)] = &[
    ("burmese", "my"),
    ("valencian", "ca"),
    ("flemish", "nl"),
    ("haitian", "ht"),
    ("letzeburgesch", "lb"),
    ("pushto", "ps"),
    ("panjabi", "pa"),
    ("moldavian", "ro"),
    ("moldovan", "ro"),
    ("sinhalese", "si"),
    ("castilian", "es"),
];

/// Resolve a user-supplied language (code, name, or alias) to a canonical
/// two-letter code.
pub fn resolve_language(language: &str) -> Result<&'static str, WhisperError> {
    let lower = language.to_lowercase();
    for (code, name) in LANGUAGES {
        if lower == *code || lower == *name {
            return Ok(code);
        }
    }
    for (alias, code) in LANGUAGE_ALIASES {
        if lower == *alias {
            return Ok(code);
        }
    }
    Err(WhisperError::UnknownLanguage(language.to_string()))
}

/// Sub-word pieces starting with one of these characters attach to the
/// preceding piece without a space.
const NO_SPACE_BEFORE: &str = ".,!?;:'\")]}%";

/// Symbols that never occur in actual speech; single-token encodings of
/// these form the default suppression set.
const NON_SPEECH_SYMBOLS: &[&str] = &[
    "\"", "#", "(", ")", "*", "+", "/", ":", ";", "<", "=", ">", "@", "[", "\\", "]", "^", "_",
    "`", "{", "|", "}", "~", "「", "」", "『", "』", "<<", ">>", "<<<", ">>>", "--", "---", "-(",
    "-[", "('", "(\"", "((", "))", "(((", ")))", "[[", "]]", "{{", "}}", "♪♪", "♪♪♪",
];

/// Decode-oriented Whisper tokenizer.
pub struct Tokenizer {
    piece_to_id: HashMap<String, i64>,
    id_to_piece: HashMap<i64, String>,
    special_ids: HashSet<i64>,
    byte_encoder: HashMap<u8, char>,
    byte_decoder: HashMap<char, u8>,
    multilingual: bool,

    pub eot: i64,
    pub sot: i64,
    pub sot_prev: i64,
    pub sot_lm: i64,
    pub transcribe: i64,
    pub translate: i64,
    pub no_timestamps: i64,
    pub no_speech: Option<i64>,
}

impl Tokenizer {
    /// Load a tokenizer from `tokenizer.json` in the HuggingFace layout.
    pub fn from_file(path: &Path, multilingual: bool) -> Result<Self, WhisperError> {
        if !path.exists() {
            return Err(WhisperError::TokenizerNotFound(path.display().to_string()));
        }

        log::info!("Loading tokenizer from {:?}...", path);
        let file = File::open(path)?;
        let json: serde_json::Value = serde_json::from_reader(BufReader::new(file))?;

        let mut piece_to_id = HashMap::new();
        let mut special_ids = HashSet::new();

        if let Some(vocab) = json
            .get("model")
            .and_then(|m| m.get("vocab"))
            .and_then(|v| v.as_object())
        {
            for (piece, id) in vocab {
                if let Some(id) = id.as_i64() {
                    piece_to_id.insert(piece.clone(), id);
                }
            }
        }
        if let Some(added) = json.get("added_tokens").and_then(|v| v.as_array()) {
            for token in added {
                let (Some(piece), Some(id)) = (
                    token.get("content").and_then(|c| c.as_str()),
                    token.get("id").and_then(|i| i.as_i64()),
                ) else {
                    continue;
                };
                piece_to_id.insert(piece.to_string(), id);
                if token
                    .get("special")
                    .and_then(|s| s.as_bool())
                    .unwrap_or(true)
                {
                    special_ids.insert(id);
                }
            }
        }

        if piece_to_id.is_empty() {
            return Err(WhisperError::Tokenization(
                "no vocabulary found in tokenizer.json".to_string(),
            ));
        }
        log::debug!("Loaded {} vocabulary entries", piece_to_id.len());

        Self::from_vocab(piece_to_id, special_ids, multilingual)
    }

    /// Build a tokenizer from an explicit vocabulary.
    ///
    /// Requires the standard special markers to be present; `<|nospeech|>`
    /// is optional.
    pub fn from_vocab(
        piece_to_id: HashMap<String, i64>,
        mut special_ids: HashSet<i64>,
        multilingual: bool,
    ) -> Result<Self, WhisperError> {
        let lookup = |name: &str| -> Result<i64, WhisperError> {
            piece_to_id
                .get(name)
                .copied()
                .ok_or_else(|| WhisperError::Tokenization(format!("missing special token {name}")))
        };

        let eot = lookup("<|endoftext|>")?;
        let sot = lookup("<|startoftranscript|>")?;
        let sot_prev = lookup("<|startofprev|>")?;
        let sot_lm = lookup("<|startoflm|>")?;
        let transcribe = lookup("<|transcribe|>")?;
        let translate = lookup("<|translate|>")?;
        let no_timestamps = lookup("<|notimestamps|>")?;
        let no_speech = piece_to_id.get("<|nospeech|>").copied();

        special_ids.extend([eot, sot, sot_prev, sot_lm, transcribe, translate, no_timestamps]);
        special_ids.extend(no_speech);

        let id_to_piece = piece_to_id.iter().map(|(p, &i)| (i, p.clone())).collect();
        let (byte_encoder, byte_decoder) = build_byte_maps();

        Ok(Self {
            piece_to_id,
            id_to_piece,
            special_ids,
            byte_encoder,
            byte_decoder,
            multilingual,
            eot,
            sot,
            sot_prev,
            sot_lm,
            transcribe,
            translate,
            no_timestamps,
            no_speech,
        })
    }

    pub fn is_multilingual(&self) -> bool {
        self.multilingual
    }

    /// Marker token for a canonical language code.
    pub fn language_token(&self, code: &str) -> Result<i64, WhisperError> {
        self.piece_to_id
            .get(&format!("<|{code}|>"))
            .copied()
            .ok_or_else(|| WhisperError::UnknownLanguage(code.to_string()))
    }

    /// Start-of-transcript prefix: `sot`, then for multilingual models the
    /// language marker and the task marker.
    pub fn sot_sequence(&self, language: Option<&str>, task: Task) -> Result<Vec<i64>, WhisperError> {
        let mut sequence = vec![self.sot];
        if let Some(code) = language {
            sequence.push(self.language_token(code)?);
            sequence.push(match task {
                Task::Transcribe => self.transcribe,
                Task::Translate => self.translate,
            });
        }
        Ok(sequence)
    }

    /// Look up the single-token encoding of a text piece, if one exists.
    pub fn piece_id(&self, text: &str) -> Option<i64> {
        let encoded: String = text
            .bytes()
            .map(|b| self.byte_encoder.get(&b).copied().unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
        self.piece_to_id.get(&encoded).copied()
    }

    /// Token IDs whose text could not plausibly occur in speech: bracket and
    /// quote symbols, music notes, and their space-prefixed forms, restricted
    /// to symbols that encode as a single token.
    pub fn non_speech_tokens(&self) -> Vec<i64> {
        let mut result: Vec<i64> = Vec::new();
        for piece in [" -", " '"] {
            result.extend(self.piece_id(piece));
        }
        for symbol in NON_SPEECH_SYMBOLS {
            result.extend(self.piece_id(symbol));
            result.extend(self.piece_id(&format!(" {symbol}")));
        }
        result.sort_unstable();
        result.dedup();
        result
    }

    /// Decode token IDs to text.
    ///
    /// Special tokens are skipped. Sub-word pieces are joined with
    /// punctuation-aware spacing: a piece whose first character (after the
    /// BPE space marker) is in the no-space punctuation set is concatenated
    /// without a leading space.
    pub fn decode(&self, token_ids: &[i64]) -> String {
        let mut out = String::new();
        for &id in token_ids {
            if self.special_ids.contains(&id) {
                continue;
            }
            let Some(piece) = self.id_to_piece.get(&id) else {
                continue;
            };

            let mut bytes = Vec::with_capacity(piece.len());
            for c in piece.chars() {
                match self.byte_decoder.get(&c) {
                    Some(&b) => bytes.push(b),
                    None => bytes.extend(c.to_string().as_bytes()),
                }
            }
            let text = String::from_utf8_lossy(&bytes).into_owned();

            match text.strip_prefix(' ') {
                Some(rest)
                    if rest
                        .chars()
                        .next()
                        .is_some_and(|c| NO_SPACE_BEFORE.contains(c)) =>
                {
                    out.push_str(rest)
                }
                _ => out.push_str(&text),
            }
        }
        out
    }
}

/// GPT-2 style byte-to-unicode mapping: printable bytes map to themselves,
/// the rest to code points starting at U+0100.
fn build_byte_maps() -> (HashMap<u8, char>, HashMap<char, u8>) {
    let mut byte_encoder = HashMap::new();
    let mut byte_decoder = HashMap::new();

    let mut n = 0u32;
    for b in 0u8..=255 {
        let c = if (b'!'..=b'~').contains(&b)
            || (0xA1..=0xAC).contains(&b)
            || (0xAE..=0xFF).contains(&b)
        {
            b as char
        } else {
            let c = char::from_u32(256 + n).unwrap_or(char::REPLACEMENT_CHARACTER);
            n += 1;
            c
        };
        byte_encoder.insert(b, c);
        byte_decoder.insert(c, b);
    }

    (byte_encoder, byte_decoder)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tokenizer() -> Tokenizer {
        let mut vocab = HashMap::new();
        // "Ġ" is the byte-encoded space (0x20 -> U+0120).
        for (i, piece) in [
            "Ġhello", "Ġworld", ",", "Ġyes", "ing", "Ġ(", "(", "Ġ-", "Ġ'", "Ġ",
        ]
        .iter()
        .enumerate()
        {
            vocab.insert(piece.to_string(), i as i64);
        }
        for (i, piece) in [
            "<|endoftext|>",
            "<|startoftranscript|>",
            "<|en|>",
            "<|ru|>",
            "<|translate|>",
            "<|transcribe|>",
            "<|startoflm|>",
            "<|startofprev|>",
            "<|nospeech|>",
            "<|notimestamps|>",
        ]
        .iter()
        .enumerate()
        {
            vocab.insert(piece.to_string(), 100 + i as i64);
        }
        let specials: HashSet<i64> = (100..110).collect();
        Tokenizer::from_vocab(vocab, specials, true).unwrap()
    }

    #[test]
    fn resolves_codes_names_and_aliases() {
        assert_eq!(resolve_language("en").unwrap(), "en");
        assert_eq!(resolve_language("English").unwrap(), "en");
        assert_eq!(resolve_language("castilian").unwrap(), "es");
        assert_eq!(resolve_language("Moldovan").unwrap(), "ro");
        assert!(matches!(
            resolve_language("klingon"),
            Err(WhisperError::UnknownLanguage(_))
        ));
    }

    #[test]
    fn byte_map_round_trips_space_marker() {
        let (enc, dec) = build_byte_maps();
        assert_eq!(enc[&b' '], '\u{120}');
        assert_eq!(dec[&'\u{120}'], b' ');
        assert_eq!(enc[&b'a'], 'a');
    }

    #[test]
    fn decode_joins_with_punctuation_aware_spacing() {
        let t = test_tokenizer();
        // "Ġhello" "," "Ġworld" -> "hello, world" after trim
        assert_eq!(t.decode(&[0, 2, 1]).trim(), "hello, world");
        // continuation piece attaches directly: "Ġhello" "ing"
        assert_eq!(t.decode(&[0, 4]).trim(), "helloing");
    }

    #[test]
    fn decode_skips_special_tokens() {
        let t = test_tokenizer();
        let with_specials = [101, 102, 105, 109, 0, 1, 100];
        assert_eq!(t.decode(&with_specials).trim(), "hello world");
    }

    #[test]
    fn sot_sequence_includes_language_and_task() {
        let t = test_tokenizer();
        let seq = t.sot_sequence(Some("ru"), Task::Transcribe).unwrap();
        assert_eq!(seq, vec![t.sot, 103, t.transcribe]);
        let seq = t.sot_sequence(None, Task::Translate).unwrap();
        assert_eq!(seq, vec![t.sot]);
    }

    #[test]
    fn non_speech_tokens_are_sorted_single_token_symbols() {
        let t = test_tokenizer();
        let set = t.non_speech_tokens();
        // "(", "Ġ(", "Ġ-", "Ġ'" are present in the test vocab.
        assert!(set.contains(&5));
        assert!(set.contains(&6));
        assert!(set.contains(&7));
        assert!(set.contains(&8));
        let mut sorted = set.clone();
        sorted.sort_unstable();
        assert_eq!(set, sorted);
    }
}
