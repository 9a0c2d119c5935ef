// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::path::Path;

use cidr::IpCidr;
use log::*;
use serde::Deserialize;

use crate::config::read_config_file;
use crate::Error;

#[derive(Debug, Deserialize)]
struct RawRuleSet {
    ruleset: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    source: String,
    destination: String,
    proto: String,
}

/// One flow-matching rule: kill established TCP flows observed going from
/// `src` to `dst`. Direction matters; the reverse direction of the same
/// connection does not match.
#[derive(Debug, Clone)]
pub struct Rule {
    pub src: IpCidr,
    pub dst: IpCidr,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

pub struct RuleSet {
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn load(path: &Path) -> Result<Self, Error> {
        parse(&read_config_file(path)?)
    }
}

fn parse(text: &str) -> Result<RuleSet, Error> {
    let raw: RawRuleSet =
        serde_json::from_str(text).map_err(|e| Error::ConfigMalformed(format!("ruleset: {e}")))?;

    let mut rules = Vec::new();
    for entry in raw.ruleset {
        if entry.proto != "tcp" {
            warn!("ignoring rule with unsupported proto '{}'", entry.proto);
            continue;
        }

        let src = parse_cidr(&entry.source)?;
        let dst = parse_cidr(&entry.destination)?;
        rules.push(Rule { src, dst });
    }

    Ok(RuleSet { rules })
}

fn parse_cidr(text: &str) -> Result<IpCidr, Error> {
    text.parse::<IpCidr>()
        .map_err(|e| Error::ConfigMalformed(format!("ruleset: bad prefix '{text}': {e}")))
}
