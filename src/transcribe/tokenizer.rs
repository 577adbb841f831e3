use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};

pub const SOT: i64 = 50258;
pub const EOT: i64 = 50257;
pub const TRANSCRIBE: i64 = 50359;
pub const NO_TIMESTAMPS: i64 = 50363;
pub const TIMESTAMP_BEGIN: i64 = 50364;

/// Token id of the single-space subword.
pub const SPACE: i64 = 220;

/// Token ids suppressed on every decode step.
pub const SUPPRESS_TOKENS: &[usize] = &[
    1, 2, 7, 8, 9, 10, 14, 25, 26, 27, 28, 29, 31, 58, 59, 60, 61, 62, 63, 90, 91, 92, 93, 359,
    503, 522, 542, 873, 893, 902, 918, 922, 931, 1350, 1853, 1982, 2460, 2627, 3246, 3253, 3268,
    3536, 3846, 3961, 4183, 4667, 6585, 6647, 7273, 9061, 9383, 10428, 10929, 11938, 12033, 12331,
    12562, 13793, 14157, 14635, 15265, 15618, 16553, 16604, 18362, 18956, 20075, 21675, 22520,
    26130, 26161, 26435, 28279, 29464, 31650, 32302, 32470, 36865, 42863, 47425, 49870, 50254,
    50258, 50360, 50361, 50362,
];

/// Language token id to ISO code, ascending by id.
pub const LANGUAGES: &[(i64, &str)] = &[
    (50259, "en"),
    (50260, "zh"),
    (50261, "de"),
    (50262, "es"),
    (50263, "ru"),
    (50264, "ko"),
    (50265, "fr"),
    (50266, "ja"),
    (50267, "pt"),
    (50268, "tr"),
    (50269, "pl"),
    (50270, "ca"),
    (50271, "nl"),
    (50272, "ar"),
    (50273, "sv"),
    (50274, "it"),
    (50275, "id"),
    (50276, "hi"),
    (50277, "fi"),
    (50278, "vi"),
    (50279, "he"),
    (50280, "uk"),
    (50281, "el"),
    (50282, "ms"),
    (50283, "cs"),
    (50284, "ro"),
    (50285, "da"),
    (50286, "hu"),
    (50287, "ta"),
    (50288, "no"),
    (50289, "th"),
    (50290, "ur"),
    (50291, "hr"),
    (50292, "bg"),
    (50293, "lt"),
    (50294, "la"),
    (50295, "mi"),
    (50296, "ml"),
    (50297, "cy"),
    (50298, "sk"),
    (50299, "te"),
    (50300, "fa"),
    (50301, "lv"),
    (50302, "bn"),
    (50303, "sr"),
    (50304, "az"),
    (50305, "sl"),
    (50306, "kn"),
    (50307, "et"),
    (50308, "mk"),
    (50309, "br"),
    (50310, "eu"),
    (50311, "is"),
    (50312, "hy"),
    (50313, "ne"),
    (50314, "mn"),
    (50315, "bs"),
    (50316, "kk"),
    (50317, "sq"),
    (50318, "sw"),
    (50319, "gl"),
    (50320, "mr"),
    (50321, "pa"),
    (50322, "si"),
    (50323, "km"),
    (50324, "sn"),
    (50325, "yo"),
    (50326, "so"),
    (50327, "af"),
    (50328, "oc"),
    (50329, "ka"),
    (50330, "be"),
    (50331, "tg"),
    (50332, "sd"),
    (50333, "gu"),
    (50334, "am"),
    (50335, "yi"),
    (50336, "lo"),
    (50337, "uz"),
    (50338, "fo"),
    (50339, "ht"),
    (50340, "ps"),
    (50341, "tk"),
    (50342, "nn"),
    (50343, "mt"),
    (50344, "sa"),
    (50345, "lb"),
    (50346, "my"),
    (50347, "bo"),
    (50348, "tl"),
    (50349, "mg"),
    (50350, "as"),
    (50351, "tt"),
    (50352, "haw"),
    (50353, "ln"),
    (50354, "ha"),
    (50355, "ba"),
    (50356, "jw"),
    (50357, "su"),
];

pub fn language_code(token: i64) -> Option<&'static str> {
    LANGUAGES
        .iter()
        .find(|&&(id, _)| id == token)
        .map(|&(_, code)| code)
}

/// Byte-level subword alphabet: a bijection between the 256 byte values and
/// unicode characters. Printable Latin-1-range bytes map to themselves; the
/// rest map to code points starting at U+0100.
struct Alphabet {
    byte_to_char: [char; 256],
    char_to_byte: HashMap<char, u8>,
}

static ALPHABET: OnceLock<Alphabet> = OnceLock::new();

fn alphabet() -> &'static Alphabet {
    ALPHABET.get_or_init(|| {
        let mut bytes: Vec<u8> = (b'!'..=b'~').chain(0xA1..=0xAC).chain(0xAE..=0xFF).collect();
        let mut chars: Vec<u32> = bytes.iter().map(|&b| b as u32).collect();

        let mut n = 0;
        for b in 0..=255u8 {
            if !bytes.contains(&b) {
                bytes.push(b);
                chars.push(256 + n);
                n += 1;
            }
        }

        let mut byte_to_char = ['\0'; 256];
        let mut char_to_byte = HashMap::with_capacity(256);
        for (&b, &c) in bytes.iter().zip(chars.iter()) {
            let c = char::from_u32(c).unwrap();
            byte_to_char[b as usize] = c;
            char_to_byte.insert(c, b);
        }

        Alphabet {
            byte_to_char,
            char_to_byte,
        }
    })
}

static VOCAB: OnceLock<HashMap<i64, String>> = OnceLock::new();

/// Install the reverse vocabulary from a `subword string -> id` map.
/// Idempotent; the first initialization wins.
pub fn init_vocabulary(vocab: HashMap<String, i64>) {
    let reverse = vocab.into_iter().map(|(s, id)| (id, s)).collect();
    _ = VOCAB.set(reverse);
}

/// Load and install the vocabulary from a vocab.json file.
pub fn init_vocabulary_from_file(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read vocabulary {}", path.display()))?;
    let vocab: HashMap<String, i64> = serde_json::from_str(&json)
        .with_context(|| format!("failed to parse vocabulary {}", path.display()))?;
    init_vocabulary(vocab);
    Ok(())
}

/// Map a single byte through the alphabet.
pub fn byte_to_char(b: u8) -> char {
    alphabet().byte_to_char[b as usize]
}

/// Map an alphabet character back to its byte, if it belongs to the alphabet.
pub fn char_to_byte(c: char) -> Option<u8> {
    alphabet().char_to_byte.get(&c).copied()
}

/// Reverse a token sequence to text. Unknown ids are skipped; malformed byte
/// sequences become replacement characters.
pub fn decode(tokens: &[i64]) -> Result<String> {
    let vocab = VOCAB.get().context("vocabulary not initialized")?;
    let alphabet = alphabet();

    let mut bytes = Vec::new();
    for token in tokens {
        if let Some(subword) = vocab.get(token) {
            for c in subword.chars() {
                if let Some(&b) = alphabet.char_to_byte.get(&c) {
                    bytes.push(b);
                }
            }
        }
    }

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
pub(crate) fn init_test_vocabulary() {
    let vocab = [
        ("hello", 100),
        ("Ġworld", 101), // 'Ġ' encodes 0x20
        ("\u{00c3}\u{00a9}", 102), // bytes 0xC3 0xA9, UTF-8 for 'é'
        ("\u{00c3}", 103), // lone continuation byte 0xC3
    ]
    .into_iter()
    .map(|(s, id)| (s.to_string(), id))
    .collect();
    init_vocabulary(vocab);
}
