//! EFT fit-text parser, grounded directly in
//! `original_source/src/mkts_backend/utils/parse_fits.py::parse_eft_fit_file`.
//!
//! State machine: a bracket header line `[Ship, Fit Name]` sets ship/fit
//! name; a blank line advances a slot generator that yields
//! `LoSlot, MedSlot, HiSlot, RigSlot, DroneBay` once each and then `Cargo`
//! forever; slot-typed lines (`LoSlot`/`MedSlot`/`HiSlot`/`RigSlot`) get a
//! per-slot-type numeric suffix (`LoSlot0`, `LoSlot1`, ...), `DroneBay` and
//! `Cargo` do not; a trailing `xN` is the stack quantity.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static QUANTITY_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+x(\d+)$").unwrap());

const NUMBERED_SLOTS: [&str; 4] = ["LoSlot", "MedSlot", "HiSlot", "RigSlot"];

/// One parsed line: a slot flag (possibly numbered), an item name still
/// needing resolution to a `type_id`, and its stack quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFitItem {
    pub flag: String,
    pub item_name: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFit {
    pub ship_name: String,
    pub fit_name: String,
    pub items: Vec<ParsedFitItem>,
}

struct SlotYielder {
    fixed: std::vec::IntoIter<&'static str>,
}

impl SlotYielder {
    fn new() -> Self {
        Self {
            fixed: vec!["LoSlot", "MedSlot", "HiSlot", "RigSlot", "DroneBay"].into_iter(),
        }
    }

    fn next(&mut self) -> &'static str {
        self.fixed.next().unwrap_or("Cargo")
    }
}

/// Parses EFT-format fit text into `ParsedFitItem`s. Pure text → structure;
/// type_id resolution happens one layer up (`fit::update`), since it needs
/// the static catalogue.
pub fn parse_eft(text: &str) -> ParsedFit {
    let mut slot_gen = SlotYielder::new();
    let mut current_slot: Option<&'static str> = None;
    let mut ship_name = String::new();
    let mut fit_name = String::new();
    let mut slot_counters: HashMap<&'static str, u32> = HashMap::new();
    let mut items = Vec::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();

        if line.starts_with('[') && line.ends_with(']') {
            let inner = &line[1..line.len() - 1];
            let mut parts = inner.splitn(2, ',');
            ship_name = parts.next().unwrap_or("").trim().to_string();
            fit_name = parts
                .next()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Unnamed Fit".to_string());
            continue;
        }

        if line.is_empty() {
            current_slot = Some(slot_gen.next());
            continue;
        }

        let slot = *current_slot.get_or_insert_with(|| slot_gen.next());

        let (item_name, quantity) = match QUANTITY_SUFFIX.captures(line) {
            Some(caps) => {
                let qty: i64 = caps.get(1).unwrap().as_str().parse().unwrap_or(1);
                let matched = caps.get(0).unwrap();
                (line[..matched.start()].trim().to_string(), qty)
            }
            None => (line.to_string(), 1),
        };

        let flag = if NUMBERED_SLOTS.contains(&slot) {
            let counter = slot_counters.entry(slot).or_insert(0);
            let flag = format!("{slot}{counter}");
            *counter += 1;
            flag
        } else {
            slot.to_string()
        };

        items.push(ParsedFitItem {
            flag,
            item_name,
            quantity,
        });
    }

    ParsedFit {
        ship_name,
        fit_name,
        items,
    }
}
