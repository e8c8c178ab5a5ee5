// SPDX-License-Identifier: BSD-3-Clause

//! Metadesc negotiation.
//!
//! A metadesc is a typed set of template packets describing either what a
//! sniffer is able to emit or what a module is able to consume. A template
//! names the four layer positions (`link:l2:l3:l4`); each position takes
//! `any`, `none` or a concrete protocol. The core scores every
//! (module input, sniffer output) pair and, for the winning pair, projects
//! the module's template into the packet filter capture evaluates.
//!
//! Template text follows the original notation, e.g. `link:eth:any:any`
//! for an Ethernet sniffer or `any:any:~ip:~tcp` for a module that wants
//! TCP over IP; a leading `~` (header fields of interest) is accepted and
//! treated as the concrete protocol.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::error::Error;
use crate::filter::Filter;
use crate::pkt::{ComoType, L3Type, L4Type, LinkType};
use crate::timestamp::Timestamp;

bitflags! {
    /// Properties a sniffer guarantees or a module requires.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MetadescFlags: u32 {
        /// Packet lengths are averages over aggregated flows, not exact.
        const PKT_LENS_ARE_AVERAGED = 1 << 0;
        /// Payloads are captured in full (no snap length).
        const HAS_FULL_PKTS = 1 << 1;
    }
}

/// One position of a template: indifferent, absent, or a concrete protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSpec<T> {
    /// Any value is acceptable (or, on the sniffer side, may occur).
    Any,
    /// The layer is absent / not required.
    None,
    /// Exactly this protocol.
    Is(T),
}

/// A template packet: one `LayerSpec` per layer position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    /// Top-level type position.
    pub link: LayerSpec<ComoType>,
    /// Link-layer position.
    pub l2: LayerSpec<LinkType>,
    /// Network-layer position.
    pub l3: LayerSpec<L3Type>,
    /// Transport-layer position.
    pub l4: LayerSpec<L4Type>,
}

impl Template {
    /// A template accepting everything.
    pub const ANY: Template = Template {
        link: LayerSpec::Any,
        l2: LayerSpec::Any,
        l3: LayerSpec::Any,
        l4: LayerSpec::Any,
    };

    /// Projects the template into a filter: each concrete layer becomes a
    /// predicate, `any`/`none` positions contribute nothing.
    #[must_use]
    pub fn to_filter(&self) -> Filter {
        let mut f = Filter::All;
        if let LayerSpec::Is(t) = self.link {
            f = f.and(Filter::Link(t));
        }
        if let LayerSpec::Is(t) = self.l2 {
            f = f.and(Filter::L2(t));
        }
        if let LayerSpec::Is(t) = self.l3 {
            f = f.and(Filter::L3(t));
        }
        if let LayerSpec::Is(t) = self.l4 {
            f = f.and(Filter::L4(t));
        }
        f
    }
}

impl FromStr for Template {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| Error::InvalidTemplate {
            template: s.to_owned(),
            reason: reason.to_owned(),
        };
        let mut parts = s.split(':');
        let mut next = |layer: &'static str| {
            parts.next().map(|p| (layer, p.trim().trim_start_matches('~'))).ok_or_else(|| bad("expected four `:`-separated positions"))
        };
        let link = parse_layer(next("link")?, |n| match n {
            "link" => Some(ComoType::Link),
            "radio" => Some(ComoType::Radio),
            "nf" => Some(ComoType::NetFlow),
            "sflow" => Some(ComoType::Sflow),
            _ => None,
        })?;
        let l2 = parse_layer(next("l2")?, |n| match n {
            "eth" => Some(LinkType::Eth),
            "vlan" => Some(LinkType::Vlan),
            "isl" => Some(LinkType::Isl),
            "hdlc" => Some(LinkType::Hdlc),
            "802.11" => Some(LinkType::Ieee80211),
            _ => None,
        })?;
        let l3 = parse_layer(next("l3")?, |n| match n {
            "ip" => Some(L3Type::Ip),
            _ => None,
        })?;
        let l4 = parse_layer(next("l4")?, |n| match n {
            "tcp" => Some(L4Type::Tcp),
            "udp" => Some(L4Type::Udp),
            _ => None,
        })?;
        if parts.next().is_some() {
            return Err(bad("more than four positions"));
        }
        Ok(Template { link, l2, l3, l4 })
    }
}

fn parse_layer<T>(
    (layer, name): (&'static str, &str),
    lookup: impl Fn(&str) -> Option<T>,
) -> Result<LayerSpec<T>, Error> {
    match name {
        "any" => Ok(LayerSpec::Any),
        "none" => Ok(LayerSpec::None),
        _ => lookup(name).map(LayerSpec::Is).ok_or_else(|| Error::UnknownProtocol {
            name: name.to_owned(),
            layer,
        }),
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn pos<T>(
            f: &mut fmt::Formatter<'_>,
            spec: &LayerSpec<T>,
            name: impl Fn(&T) -> &'static str,
        ) -> fmt::Result {
            match spec {
                LayerSpec::Any => write!(f, "any"),
                LayerSpec::None => write!(f, "none"),
                LayerSpec::Is(t) => write!(f, "{}", name(t)),
            }
        }
        pos(f, &self.link, |t| match t {
            ComoType::None => "none",
            ComoType::Link => "link",
            ComoType::Radio => "radio",
            ComoType::NetFlow => "nf",
            ComoType::Sflow => "sflow",
        })?;
        write!(f, ":")?;
        pos(f, &self.l2, |t| match t {
            LinkType::None => "none",
            LinkType::Eth => "eth",
            LinkType::Vlan => "vlan",
            LinkType::Isl => "isl",
            LinkType::Hdlc => "hdlc",
            LinkType::Ieee80211 => "802.11",
        })?;
        write!(f, ":")?;
        pos(f, &self.l3, |t| match t {
            L3Type::None => "none",
            L3Type::Ip => "ip",
        })?;
        write!(f, ":")?;
        pos(f, &self.l4, |t| match t {
            L4Type::None => "none",
            L4Type::Tcp => "tcp",
            L4Type::Udp => "udp",
        })
    }
}

/// What a sniffer emits or a module consumes: templates plus the coarse
/// properties that gate compatibility.
#[derive(Debug, Clone, Default)]
pub struct Metadesc {
    /// Coarsest acceptable (module) or provided (sniffer) timestamp step.
    /// `Timestamp::ZERO` means native resolution.
    pub ts_resolution: Timestamp,
    /// Guaranteed (sniffer) or required (module) properties.
    pub flags: MetadescFlags,
    /// Names of pktmeta entries provided (sniffer) or required (module).
    pub pktmeta: Vec<String>,
    /// The template set; empty means "anything".
    pub templates: Vec<Template>,
}

impl Metadesc {
    /// A metadesc that accepts or emits anything at native resolution.
    #[must_use]
    pub fn any() -> Self {
        Metadesc { templates: vec![Template::ANY], ..Metadesc::default() }
    }

    /// Builds a metadesc from template text forms.
    pub fn with_templates<'a>(
        templates: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, Error> {
        let templates = templates
            .into_iter()
            .map(Template::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Metadesc { templates, ..Metadesc::default() })
    }

    /// Projects the whole metadesc into a filter (disjunction over
    /// templates).
    #[must_use]
    pub fn to_filter(&self) -> Filter {
        let mut per_tpl = self.templates.iter().map(Template::to_filter);
        let Some(first) = per_tpl.next() else {
            return Filter::All;
        };
        per_tpl.fold(first, |acc, f| {
            if acc == f { acc } else { acc.or(f) }
        })
    }
}

/// The outcome of matching a module input against a sniffer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadescMatch {
    /// The affinity score; higher is better.
    pub affinity: u32,
    /// Index of the winning template in the module's input metadesc.
    pub in_tpl: usize,
    /// Index of the winning template in the sniffer's output metadesc.
    pub out_tpl: usize,
}

/// Scores a (sniffer output, module input) pair.
///
/// Returns `None` when the pair is incompatible: the sniffer's timestamps
/// are coarser than the module requires, a required flag or pktmeta entry
/// is missing, or no input template fits any output template.
#[must_use]
pub fn best_match(out: &Metadesc, input: &Metadesc) -> Option<MetadescMatch> {
    if input.ts_resolution != Timestamp::ZERO && out.ts_resolution > input.ts_resolution {
        return None;
    }
    if !out.flags.contains(input.flags) {
        return None;
    }
    for required in &input.pktmeta {
        if !out.pktmeta.contains(required) {
            return None;
        }
    }
    let meta_bonus = input.pktmeta.len() as u32;

    let in_tpls: &[Template] = if input.templates.is_empty() { &[Template::ANY] } else { &input.templates };
    let out_tpls: &[Template] = if out.templates.is_empty() { &[Template::ANY] } else { &out.templates };

    let mut best: Option<MetadescMatch> = None;
    for (i, in_tpl) in in_tpls.iter().enumerate() {
        for (o, out_tpl) in out_tpls.iter().enumerate() {
            let Some(score) = template_score(in_tpl, out_tpl) else {
                continue;
            };
            let candidate = MetadescMatch { affinity: score + meta_bonus, in_tpl: i, out_tpl: o };
            if best.is_none_or(|b| candidate.affinity > b.affinity) {
                best = Some(candidate);
            }
        }
    }
    best
}

/// Scores one template pair; `None` means the pair cannot coexist.
fn template_score(input: &Template, out: &Template) -> Option<u32> {
    Some(
        layer_score(&input.link, &out.link)?
            + layer_score(&input.l2, &out.l2)?
            + layer_score(&input.l3, &out.l3)?
            + layer_score(&input.l4, &out.l4)?,
    )
}

/// Exact concrete matches beat `any` matches; a concrete requirement the
/// sniffer cannot produce kills the pair.
fn layer_score<T: PartialEq>(input: &LayerSpec<T>, out: &LayerSpec<T>) -> Option<u32> {
    match (input, out) {
        (LayerSpec::Is(a), LayerSpec::Is(b)) if a == b => Some(2),
        (LayerSpec::Is(_), LayerSpec::Any) => Some(1),
        (LayerSpec::Is(_), _) => None,
        (LayerSpec::None, LayerSpec::None) => Some(2),
        (LayerSpec::None, _) | (LayerSpec::Any, _) => Some(1),
    }
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn template_parse_and_display() {
        let t: Template = "link:eth:any:any".parse().unwrap();
        assert_eq!(t.link, LayerSpec::Is(ComoType::Link));
        assert_eq!(t.l2, LayerSpec::Is(LinkType::Eth));
        assert_eq!(t.to_string(), "link:eth:any:any");

        let t: Template = "none:none:none:~tcp".parse().unwrap();
        assert_eq!(t.l4, LayerSpec::Is(L4Type::Tcp));
        assert_eq!(t.to_string(), "none:none:none:tcp");

        assert!("link:eth:any".parse::<Template>().is_err());
        assert!("link:eth:any:any:any".parse::<Template>().is_err());
        assert!("link:frob:any:any".parse::<Template>().is_err());
    }

    #[test]
    fn filter_projection_matches_negotiation_scenario() {
        // sniffer: link:eth:any:any, module: any:any:~ip:~tcp
        let snif = Metadesc::with_templates(["link:eth:any:any"]).unwrap();
        let module = Metadesc::with_templates(["any:any:~ip:~tcp"]).unwrap();

        let m = best_match(&snif, &module).expect("pair must be compatible");
        assert_eq!(m.affinity, 4);
        assert_eq!(module.templates[m.in_tpl].to_filter().to_string(), "ip and tcp");
    }

    #[test]
    fn concrete_mismatch_is_incompatible() {
        let snif = Metadesc::with_templates(["link:hdlc:any:any"]).unwrap();
        let module = Metadesc::with_templates(["link:eth:any:any"]).unwrap();
        assert!(best_match(&snif, &module).is_none());
    }

    #[test]
    fn exact_match_outranks_any_match() {
        let snif = Metadesc::with_templates(["link:eth:ip:tcp", "link:eth:any:any"]).unwrap();
        let module = Metadesc::with_templates(["any:any:ip:tcp"]).unwrap();
        let m = best_match(&snif, &module).unwrap();
        // link:eth:ip:tcp scores 1+1+2+2, link:eth:any:any scores 1+1+1+1
        assert_eq!(m.out_tpl, 0);
        assert_eq!(m.affinity, 6);
    }

    #[test]
    fn coarser_timestamps_are_incompatible() {
        let mut snif = Metadesc::any();
        snif.ts_resolution = Timestamp::from_secs(60);
        let mut module = Metadesc::any();
        module.ts_resolution = Timestamp::from_secs(1);
        assert!(best_match(&snif, &module).is_none());
        // the other way around is fine
        assert!(best_match(&module, &snif).is_some());
    }

    #[test]
    fn missing_pktmeta_is_incompatible() {
        let snif = Metadesc::any();
        let mut module = Metadesc::any();
        module.pktmeta.push("radio-snr".to_owned());
        assert!(best_match(&snif, &module).is_none());

        let mut snif = Metadesc::any();
        snif.pktmeta.push("radio-snr".to_owned());
        let m = best_match(&snif, &module).unwrap();
        assert_eq!(m.affinity, 4 + 1);
    }

    #[test]
    fn missing_flags_are_incompatible() {
        let snif = Metadesc::any();
        let mut module = Metadesc::any();
        module.flags = MetadescFlags::HAS_FULL_PKTS;
        assert!(best_match(&snif, &module).is_none());
    }

    #[test]
    fn union_of_templates_projects_to_or() {
        let md = Metadesc::with_templates(["none:none:none:~tcp", "none:none:none:~udp"]).unwrap();
        assert_eq!(md.to_filter().to_string(), "tcp or udp");
    }
}
