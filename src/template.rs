use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::dns_message::{
    RData, ResourceRecord, DNS_CLASS_IN, DNS_TYPE_A, DNS_TYPE_AAAA, DNS_TYPE_CNAME, DNS_TYPE_MX,
    DNS_TYPE_NS, DNS_TYPE_PTR, DNS_TYPE_SOA, DNS_TYPE_TXT,
};
use crate::errors::{DnsError, DnsResult};

/// Maps a record type mnemonic to its numeric value
pub fn rtype_from_name(name: &str) -> Option<u16> {
    match name.to_uppercase().as_str() {
        "A" => Some(DNS_TYPE_A),
        "NS" => Some(DNS_TYPE_NS),
        "CNAME" => Some(DNS_TYPE_CNAME),
        "SOA" => Some(DNS_TYPE_SOA),
        "PTR" => Some(DNS_TYPE_PTR),
        "MX" => Some(DNS_TYPE_MX),
        "TXT" => Some(DNS_TYPE_TXT),
        "AAAA" => Some(DNS_TYPE_AAAA),
        _ => None,
    }
}

/// Maps a numeric record type to a display name
pub fn rtype_name(rtype: u16) -> String {
    match rtype {
        DNS_TYPE_A => "A".to_string(),
        DNS_TYPE_NS => "NS".to_string(),
        DNS_TYPE_CNAME => "CNAME".to_string(),
        DNS_TYPE_SOA => "SOA".to_string(),
        DNS_TYPE_PTR => "PTR".to_string(),
        DNS_TYPE_MX => "MX".to_string(),
        DNS_TYPE_TXT => "TXT".to_string(),
        DNS_TYPE_AAAA => "AAAA".to_string(),
        other => format!("TYPE{other}"),
    }
}

/// A resource record template whose owner-name slot is the literal `*`,
/// filled in at synthesis time.
///
/// The text form is one zone-file style line: `* <ttl> IN <type> <rdata>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordTemplate {
    text: String,
    ttl: u32,
    class: u16,
    rtype: u16,
    rdata: RData,
}

fn normalize_target(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

impl RecordTemplate {
    /// Parses the text form of a template
    pub fn parse(text: &str) -> DnsResult<Self> {
        let mut fields = text.split_whitespace();
        let malformed = |what: &str| DnsError::MalformedTemplate(format!("{what} in {text:?}"));

        let owner = fields.next().ok_or_else(|| malformed("missing owner"))?;
        if owner != "*" {
            return Err(DnsError::MalformedTemplate(format!(
                "owner must be the literal '*', got {owner:?} in {text:?}"
            )));
        }

        let ttl: u32 = fields
            .next()
            .ok_or_else(|| malformed("missing TTL"))?
            .parse()
            .map_err(|_| malformed("invalid TTL"))?;

        let class = fields.next().ok_or_else(|| malformed("missing class"))?;
        if !class.eq_ignore_ascii_case("IN") {
            return Err(malformed("unsupported class"));
        }

        let type_name = fields.next().ok_or_else(|| malformed("missing type"))?;
        let rtype = rtype_from_name(type_name)
            .ok_or_else(|| malformed("unsupported record type"))?;

        let rest: Vec<&str> = fields.collect();
        let one_field = || -> DnsResult<&str> {
            if rest.len() == 1 {
                Ok(rest[0])
            } else {
                Err(malformed("wrong RDATA field count"))
            }
        };

        let rdata = match rtype {
            DNS_TYPE_A => RData::A(
                one_field()?
                    .parse::<Ipv4Addr>()
                    .map_err(|_| malformed("invalid IPv4 address"))?,
            ),
            DNS_TYPE_AAAA => RData::Aaaa(
                one_field()?
                    .parse::<Ipv6Addr>()
                    .map_err(|_| malformed("invalid IPv6 address"))?,
            ),
            DNS_TYPE_NS => RData::Ns(normalize_target(one_field()?)),
            DNS_TYPE_CNAME => RData::Cname(normalize_target(one_field()?)),
            DNS_TYPE_PTR => RData::Ptr(normalize_target(one_field()?)),
            DNS_TYPE_MX => {
                if rest.len() != 2 {
                    return Err(malformed("MX needs preference and exchange"));
                }
                RData::Mx {
                    preference: rest[0].parse().map_err(|_| malformed("invalid MX preference"))?,
                    exchange: normalize_target(rest[1]),
                }
            }
            DNS_TYPE_SOA => {
                if rest.len() != 7 {
                    return Err(malformed("SOA needs 7 RDATA fields"));
                }
                let int = |i: usize| -> DnsResult<u32> {
                    rest[i].parse().map_err(|_| malformed("invalid SOA counter"))
                };
                RData::Soa {
                    mname: normalize_target(rest[0]),
                    rname: normalize_target(rest[1]),
                    serial: int(2)?,
                    refresh: int(3)?,
                    retry: int(4)?,
                    expire: int(5)?,
                    minimum: int(6)?,
                }
            }
            DNS_TYPE_TXT => {
                let joined = rest.join(" ");
                let bytes = joined.trim_matches('"').as_bytes();
                if bytes.len() > 255 {
                    return Err(malformed("TXT data too long"));
                }
                let mut data = Vec::with_capacity(bytes.len() + 1);
                data.push(bytes.len() as u8);
                data.extend_from_slice(bytes);
                RData::Txt(data)
            }
            _ => return Err(malformed("unsupported record type")),
        };

        Ok(Self {
            text: text.trim().to_string(),
            ttl,
            class: DNS_CLASS_IN,
            rtype,
            rdata,
        })
    }

    pub fn rtype(&self) -> u16 {
        self.rtype
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The nameserver or host this template's RDATA points at, if any
    pub fn target(&self) -> Option<&str> {
        match &self.rdata {
            RData::Ns(name) | RData::Cname(name) | RData::Ptr(name) => Some(name),
            RData::Mx { exchange, .. } => Some(exchange),
            RData::Soa { mname, .. } => Some(mname),
            _ => None,
        }
    }

    /// Builds a concrete record by substituting the owner slot
    pub fn instantiate(&self, owner: &str) -> ResourceRecord {
        ResourceRecord {
            name: owner.to_string(),
            rtype: self.rtype,
            class: self.class,
            ttl: self.ttl,
            rdata: self.rdata.clone(),
        }
    }
}

/// The record templates attached to one sinkholed zone, keyed by RRTYPE
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneTemplates {
    records: BTreeMap<u16, RecordTemplate>,
}

impl ZoneTemplates {
    /// Builds the template set from a mnemonic-keyed config table
    pub fn from_config(records: &BTreeMap<String, String>) -> DnsResult<Self> {
        let mut map = BTreeMap::new();
        for (type_name, text) in records {
            let rtype = rtype_from_name(type_name).ok_or_else(|| {
                DnsError::MalformedTemplate(format!("unknown record type key {type_name:?}"))
            })?;
            let template = RecordTemplate::parse(text)?;
            if template.rtype() != rtype {
                return Err(DnsError::MalformedTemplate(format!(
                    "record keyed {type_name} declares type {} in {text:?}",
                    rtype_name(template.rtype())
                )));
            }
            map.insert(rtype, template);
        }
        Ok(Self { records: map })
    }

    pub fn get(&self, rtype: u16) -> Option<&RecordTemplate> {
        self.records.get(&rtype)
    }

    /// Target of the NS template, if one is configured
    pub fn ns_target(&self) -> Option<&str> {
        self.get(crate::dns_message::DNS_TYPE_NS)
            .and_then(|t| t.target())
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// JSON object mapping type mnemonics to template text, for dumps
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .records
            .iter()
            .map(|(rtype, template)| {
                (
                    rtype_name(*rtype),
                    serde_json::Value::String(template.text().to_string()),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_a_template() {
        let template = RecordTemplate::parse("* 86400 IN A 10.1.2.3").unwrap();
        let rr = template.instantiate("mtfnpy.dyndns.org");

        assert_eq!(rr.name, "mtfnpy.dyndns.org");
        assert_eq!(rr.rtype, DNS_TYPE_A);
        assert_eq!(rr.ttl, 86400);
        assert_eq!(rr.rdata, RData::A("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn test_parse_ns_template_normalizes_target() {
        let template = RecordTemplate::parse("* 86400 IN NS NS.Sinkhole.Example.COM.").unwrap();
        assert_eq!(template.target(), Some("ns.sinkhole.example.com"));
    }

    #[test]
    fn test_parse_soa_template() {
        let template =
            RecordTemplate::parse("* 3600 IN SOA ns.sink.test hostmaster.sink.test 1 7200 900 604800 86400")
                .unwrap();
        let rr = template.instantiate("seized.example");
        match rr.rdata {
            RData::Soa {
                mname,
                serial,
                minimum,
                ..
            } => {
                assert_eq!(mname, "ns.sink.test");
                assert_eq!(serial, 1);
                assert_eq!(minimum, 86400);
            }
            other => panic!("expected SOA rdata, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_non_wildcard_owner() {
        assert!(RecordTemplate::parse("host 86400 IN A 10.1.2.3").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_rdata() {
        assert!(RecordTemplate::parse("* 86400 IN A not-an-address").is_err());
        assert!(RecordTemplate::parse("* 86400 IN MX 10").is_err());
        assert!(RecordTemplate::parse("* x IN A 10.1.2.3").is_err());
    }

    #[test]
    fn test_zone_templates_from_config() {
        let mut records = BTreeMap::new();
        records.insert("A".to_string(), "* 86400 IN A 10.1.2.3".to_string());
        records.insert(
            "NS".to_string(),
            "* 86400 IN NS ns.sinkhole.example.com".to_string(),
        );

        let templates = ZoneTemplates::from_config(&records).unwrap();
        assert!(templates.get(DNS_TYPE_A).is_some());
        assert_eq!(templates.ns_target(), Some("ns.sinkhole.example.com"));
        assert!(templates.get(DNS_TYPE_SOA).is_none());
    }

    #[test]
    fn test_zone_templates_rejects_type_mismatch() {
        let mut records = BTreeMap::new();
        records.insert("NS".to_string(), "* 86400 IN A 10.1.2.3".to_string());

        assert!(ZoneTemplates::from_config(&records).is_err());
    }
}
