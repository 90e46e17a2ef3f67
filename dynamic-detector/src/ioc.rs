//! Building IOC expression trees from alerts.
//!
//! Construction is deterministic and dispatches on the alert type. Each
//! node gets a fresh `dynamic_IOC_<n>` id from the builder's monotonic
//! counter; one builder lives for the lifetime of the detector, so ids are
//! unique across every tree the process ever constructs.

use ioc_matcher::{IndicatorNode, Operator, Pattern};

use crate::alert::{Alert, CommsInfo};

/// Builds IOC trees from alerts.
#[derive(Debug, Default)]
pub struct IocBuilder {
    next_id: u64,
}

impl IocBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_id(&mut self) -> String {
        let id = format!("dynamic_IOC_{}", self.next_id);
        self.next_id += 1;
        id
    }

    /// Convert an alert into its IOC tree.
    ///
    /// Unknown alert types yield `None`, as do `ip-comms` and
    /// `bidirect-ip-comms` alerts missing either IP.
    pub fn build(&mut self, alert: &Alert) -> Option<IndicatorNode> {
        match alert.kind.as_str() {
            "dns" => {
                let lead = self.leaf(
                    "hostname".into(),
                    alert.indicator.value.clone(),
                    "dns".into(),
                );
                Some(self.assemble(alert, lead))
            }
            "useragent" => {
                let lead = self.leaf(
                    "useragent".into(),
                    alert.indicator.value.clone(),
                    "string".into(),
                );
                Some(self.assemble(alert, lead))
            }
            "ip-comms" => self.build_ip_comms(alert),
            "bidirect-ip-comms" => self.build_bidirect(alert),
            _ => None,
        }
    }

    /// AND root carrying the alert's indicator: the lead leaf, then the
    /// optional device leaf, then whichever IP leaves the alert provides.
    fn assemble(&mut self, alert: &Alert, lead: IndicatorNode) -> IndicatorNode {
        let mut children = vec![lead];
        if !alert.device.is_empty() {
            children.push(self.device_node(alert));
        }
        if let Some(src) = self.ip_node(&alert.src, "src") {
            children.push(src);
        }
        if let Some(dest) = self.ip_node(&alert.dest, "dest") {
            children.push(dest);
        }
        IndicatorNode {
            id: self.create_id(),
            comment: Some(format!(
                "dynamically created {} IOC",
                alert.indicator.category
            )),
            indicator: Some(alert.indicator.clone()),
            operator: Some(Operator::And),
            children,
            ..Default::default()
        }
    }

    fn build_ip_comms(&mut self, alert: &Alert) -> Option<IndicatorNode> {
        let src = self.ip_node(&alert.src, "src");
        let dest = self.ip_node(&alert.dest, "dest");
        let (Some(src), Some(dest)) = (src, dest) else {
            tracing::error!(
                alert = ?alert,
                "ip-comms alert without src or dest IP information, no IOC built"
            );
            return None;
        };
        let mut children = vec![src, dest];
        if !alert.device.is_empty() {
            children.push(self.device_node(alert));
        }
        Some(IndicatorNode {
            id: self.create_id(),
            comment: Some(format!(
                "dynamically created {} IOC",
                alert.indicator.category
            )),
            indicator: Some(alert.indicator.clone()),
            operator: Some(Operator::And),
            children,
            ..Default::default()
        })
    }

    /// Two OR subtrees enumerate both directions of the same flow: the
    /// source side matches either endpoint as the sender, the destination
    /// side matches either endpoint as the receiver.
    fn build_bidirect(&mut self, alert: &Alert) -> Option<IndicatorNode> {
        let a_src = self.ip_and_port_node(&alert.src, "src");
        let a_dest = self.ip_and_port_node(&alert.src, "dest");
        let b_src = self.ip_and_port_node(&alert.dest, "src");
        let b_dest = self.ip_and_port_node(&alert.dest, "dest");
        let (Some(a_src), Some(a_dest), Some(b_src), Some(b_dest)) =
            (a_src, a_dest, b_src, b_dest)
        else {
            tracing::error!(
                alert = ?alert,
                "bidirect-ip-comms alert without src or dest IP information, no IOC built"
            );
            return None;
        };

        let src_node = IndicatorNode {
            id: self.create_id(),
            operator: Some(Operator::Or),
            children: vec![a_src, b_src],
            ..Default::default()
        };
        let dest_node = IndicatorNode {
            id: self.create_id(),
            operator: Some(Operator::Or),
            children: vec![a_dest, b_dest],
            ..Default::default()
        };

        let mut children = vec![src_node, dest_node];
        if !alert.device.is_empty() {
            children.push(self.device_node(alert));
        }
        Some(IndicatorNode {
            id: self.create_id(),
            indicator: Some(alert.indicator.clone()),
            operator: Some(Operator::And),
            children,
            ..Default::default()
        })
    }

    /// IP leaf: `"<family>:<address>"` becomes pattern type
    /// `<direction>.<family>` with the address as value. Absent or
    /// malformed `ip` yields no leaf.
    fn ip_node(&mut self, comms: &CommsInfo, direction: &str) -> Option<IndicatorNode> {
        if comms.ip.is_empty() {
            return None;
        }
        let (family, address) = comms.ip.split_once(':')?;
        let kind = format!("{direction}.{family}");
        Some(self.leaf(kind, address.to_string(), String::new()))
    }

    /// IP leaf, or an AND of (IP leaf, port leaf) when a port is set.
    /// The port leaf compares numerically; `proto` defaults to `tcp`.
    fn ip_and_port_node(&mut self, comms: &CommsInfo, direction: &str) -> Option<IndicatorNode> {
        let ip = self.ip_node(comms, direction)?;
        if comms.port == 0 {
            return Some(ip);
        }
        let proto = if comms.proto.is_empty() {
            "tcp"
        } else {
            comms.proto.as_str()
        };
        let port = self.leaf(
            format!("{direction}.{proto}"),
            comms.port.to_string(),
            "int".into(),
        );
        Some(IndicatorNode {
            id: self.create_id(),
            operator: Some(Operator::And),
            children: vec![ip, port],
            ..Default::default()
        })
    }

    fn device_node(&mut self, alert: &Alert) -> IndicatorNode {
        self.leaf("device".into(), alert.device.clone(), String::new())
    }

    fn leaf(&mut self, kind: String, value: String, match_kind: String) -> IndicatorNode {
        IndicatorNode {
            id: self.create_id(),
            pattern: Some(Pattern {
                kind,
                value,
                match_kind,
            }),
            ..Default::default()
        }
    }
}
