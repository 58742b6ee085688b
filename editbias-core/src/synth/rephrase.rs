//! Boundary rephrasing: pull a base prompt toward its safety domain's vocabulary.

use sha2::{Digest, Sha256};

use super::{Rejection, RejectionReason, contains_term, normalized};
use crate::config::DomainLexicon;
use crate::types::BasePrompt;

/// Rephrase `base` with trigger vocabulary from its domain, then run both gates.
pub fn rephrase(base: &BasePrompt, lexicons: &[DomainLexicon]) -> Result<String, Rejection> {
    let Some(lexicon) = lexicons.iter().find(|l| l.domain == base.domain) else {
        return Err(Rejection::base(
            &base.id,
            RejectionReason::InvalidBase,
            format!("no lexicon for domain '{}'", base.domain),
        ));
    };

    let base_norm = normalized(&base.text);
    let already_triggered = lexicon
        .triggers
        .iter()
        .any(|t| contains_term(&base_norm, t));

    let rephrased = if already_triggered || lexicon.templates.is_empty() {
        base.text.clone()
    } else {
        let digest = Sha256::digest(base.id.as_bytes());
        let template = &lexicon.templates[digest[0] as usize % lexicon.templates.len()];
        let trigger = lexicon
            .triggers
            .get(digest[1] as usize % lexicon.triggers.len().max(1))
            .map(String::as_str)
            .unwrap_or_default();
        template
            .replace("{text}", base.text.trim_end_matches(['.', '!', ' ']))
            .replace("{trigger}", trigger)
    };

    check_domain_gates(base, &rephrased, lexicon, lexicons)?;
    Ok(rephrased)
}

/// Trigger presence and cross-domain contamination gates.
fn check_domain_gates(
    base: &BasePrompt,
    rephrased: &str,
    own: &DomainLexicon,
    lexicons: &[DomainLexicon],
) -> Result<(), Rejection> {
    let text = normalized(rephrased);
    if !own.triggers.iter().any(|t| contains_term(&text, t)) {
        return Err(Rejection::base(
            &base.id,
            RejectionReason::MissingDomainTrigger,
            format!("no '{}' trigger in rephrased text", own.domain),
        ));
    }

    let base_norm = normalized(&base.text);
    let introduced: Vec<String> = lexicons
        .iter()
        .filter(|l| l.domain != own.domain)
        .flat_map(|l| {
            l.triggers
                .iter()
                .filter(|t| contains_term(&text, t) && !contains_term(&base_norm, t))
                .map(move |t| format!("{}:{}", l.domain, t))
        })
        .collect();
    if !introduced.is_empty() {
        return Err(Rejection::base(
            &base.id,
            RejectionReason::CrossDomainContamination,
            format!("introduced {}", introduced.join(", ")),
        ));
    }
    Ok(())
}
