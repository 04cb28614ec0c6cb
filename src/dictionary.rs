use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::tags::{self, EncodedTags};
use crate::{Error, Result};

/// Value-ids are persisted as 3-byte integers.
pub const MAX_VALUES_PER_KEY: usize = 1 << 24;

const NUMBER_CHARS: &str = "-.0123456789";

/// Reversible string-to-integer compressor for tag keys and values.
///
/// Keys share one global id space; values get their own id space per key.
/// Per-key value lists are sorted with [`natural_cmp`] on
/// [`finalize`](TagDictionary::finalize), so ordering comparisons over
/// value-ids match the natural order of the underlying strings.
#[derive(Debug, Default)]
pub struct TagDictionary {
    keys: Vec<String>,
    values: Vec<Vec<String>>,
    key_ids: HashMap<String, u32>,
    value_ids: Vec<HashMap<String, u32>>,
}

impl TagDictionary {
    /// Record every key and value of `tags`, assigning fresh ids to unseen
    /// strings. Ids are provisional until [`finalize`](Self::finalize).
    pub fn add<'a>(&mut self, tags: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<()> {
        for (key, value) in tags {
            let key_id = match self.key_ids.get(key) {
                Some(&id) => id as usize,
                None => {
                    let id = self.keys.len();
                    self.keys.push(key.to_string());
                    self.values.push(Vec::new());
                    self.value_ids.push(HashMap::new());
                    self.key_ids.insert(key.to_string(), id as u32);
                    id
                }
            };
            if !self.value_ids[key_id].contains_key(value) {
                if self.values[key_id].len() >= MAX_VALUES_PER_KEY {
                    return Err(Error::ValueIdOverflow(self.keys[key_id].clone()));
                }
                let id = self.values[key_id].len() as u32;
                self.values[key_id].push(value.to_string());
                self.value_ids[key_id].insert(value.to_string(), id);
            }
        }
        Ok(())
    }

    /// Sort every per-key value list into natural order and rebuild the
    /// reverse maps to match. Must run once, after the last `add`.
    pub fn finalize(&mut self) {
        for (list, ids) in self.values.iter_mut().zip(self.value_ids.iter_mut()) {
            list.sort_unstable_by(|a, b| natural_cmp(a, b));
            ids.clear();
            for (id, value) in list.iter().enumerate() {
                ids.insert(value.clone(), id as u32);
            }
        }
    }

    /// Encode a raw tag set into the bit-packed form. Every tag must have
    /// been [`add`](Self::add)ed before.
    pub fn encode<'a>(
        &self,
        tags: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<EncodedTags> {
        let mut pairs = BTreeMap::new();
        for (key, value) in tags {
            let (key_id, value_id) = self
                .indices(key, value)
                .ok_or_else(|| Error::InternalTagMissing(key.to_string(), value.to_string()))?;
            pairs.insert(key_id, value_id);
        }
        let mut encoded = EncodedTags::default();
        for (key_id, value_id) in pairs {
            tags::set_bit(&mut encoded.keys, key_id);
            encoded.values.push(value_id);
        }
        tags::trim(&mut encoded.keys);
        Ok(encoded)
    }

    /// Decode an encoded tag set back into `(key, value)` string pairs.
    pub fn decode<'a>(
        &'a self,
        tags: &'a EncodedTags,
    ) -> impl Iterator<Item = Option<(&'a str, &'a str)>> + 'a {
        tags.iter().map(|(key_id, value_id)| {
            let key = self.key(key_id)?;
            let value = self.value(key_id, value_id)?;
            Some((key, value))
        })
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn value_count(&self, key_id: u32) -> usize {
        self.values.get(key_id as usize).map_or(0, Vec::len)
    }

    pub fn key(&self, key_id: u32) -> Option<&str> {
        self.keys.get(key_id as usize).map(String::as_str)
    }

    pub fn value(&self, key_id: u32, value_id: u32) -> Option<&str> {
        self.values
            .get(key_id as usize)?
            .get(value_id as usize)
            .map(String::as_str)
    }

    pub fn key_id(&self, key: &str) -> Option<u32> {
        self.key_ids.get(key).copied()
    }

    pub fn value_id(&self, key_id: u32, value: &str) -> Option<u32> {
        self.value_ids.get(key_id as usize)?.get(value).copied()
    }

    pub fn indices(&self, key: &str, value: &str) -> Option<(u32, u32)> {
        let key_id = self.key_id(key)?;
        Some((key_id, self.value_id(key_id, value)?))
    }

    /// The largest value-index of `key_id` whose string sorts at or below
    /// `value`, or `-1` when every stored value sorts above it. The flag
    /// reports whether `value` itself is stored. Range filters are
    /// translated into id comparisons through this.
    pub fn next_lower_value_index(&self, key_id: u32, value: &str) -> (i64, bool) {
        let Some(values) = self.values.get(key_id as usize) else {
            return (-1, false);
        };
        let idx = values.partition_point(|stored| natural_cmp(stored, value) != Ordering::Greater);
        if idx == 0 {
            return (-1, false);
        }
        // `natural_cmp` ties are broken byte-wise, so an exact match can sit
        // anywhere in the run of naturally-equal values before `idx`.
        let mut exact = false;
        let mut back = idx;
        while back > 0 && natural_cmp(&values[back - 1], value) == Ordering::Equal {
            if values[back - 1] == value {
                exact = true;
                break;
            }
            back -= 1;
        }
        (idx as i64 - 1, exact)
    }

    /// Persist as one line per key: `key "=" values`, values joined by `|`.
    /// A key's id equals its 0-based line number.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(Error::io(path))?;
        let mut writer = BufWriter::new(file);
        for (key, values) in self.keys.iter().zip(&self.values) {
            let joined: Vec<_> = values.iter().map(|v| escape(v)).collect();
            writeln!(writer, "{key}={}", joined.join("|")).map_err(Error::io(path))?;
        }
        writer.flush().map_err(Error::io(path))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(Error::io(path))?;
        let mut dictionary = TagDictionary::default();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(Error::io(path))?;
            let Some((key, joined)) = line.split_once('=') else {
                return Err(Error::InputFormat(format!(
                    "dictionary line without `=`: {line:?}"
                )));
            };
            let key_id = dictionary.keys.len();
            dictionary.keys.push(key.to_string());
            dictionary.key_ids.insert(key.to_string(), key_id as u32);
            let values: Vec<String> = joined.split('|').map(unescape).collect();
            let ids = values
                .iter()
                .enumerate()
                .map(|(id, v)| (v.clone(), id as u32))
                .collect();
            dictionary.values.push(values);
            dictionary.value_ids.push(ids);
        }
        Ok(dictionary)
    }
}

fn escape(value: &str) -> String {
    value
        .replace('|', "$$PIPE$$")
        .replace('\n', "$$NEWLINE$$")
        .replace('=', "$$EQUAL$$")
}

fn unescape(value: &str) -> String {
    value
        .replace("$$EQUAL$$", "=")
        .replace("$$NEWLINE$$", "\n")
        .replace("$$PIPE$$", "|")
}

/// The numeric reading of `s`: the subsequence of `-.0123456789`
/// characters, when it forms a well-formed signed decimal.
fn number_prefix(s: &str) -> Option<f64> {
    let mut prefix = String::new();
    for c in s.chars() {
        if NUMBER_CHARS.contains(c) {
            if c == '-' && !prefix.is_empty() {
                return None;
            }
            if c == '.' && prefix.contains('.') {
                return None;
            }
            prefix.push(c);
        }
    }
    if !prefix.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    prefix.parse().ok()
}

fn is_pure_number(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| NUMBER_CHARS.contains(c))
}

/// Natural-numeric string order: numeric compare when both sides carry a
/// number, with purely-numeric strings winning ties, bytewise otherwise.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    match (number_prefix(a), number_prefix(b)) {
        (Some(num_a), Some(num_b)) => num_a
            .partial_cmp(&num_b)
            .unwrap_or(Ordering::Equal)
            .then_with(|| match (is_pure_number(a), is_pure_number(b)) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => a.cmp(b),
            }),
        _ => a.cmp(b),
    }
}

pub fn is_less_than(a: &str, b: &str) -> bool {
    natural_cmp(a, b) == Ordering::Less
}
