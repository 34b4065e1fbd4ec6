/*
    Joins the flat device description into meters and derives the poll plan of each one.

    Only enabled channels are taken, sorted by their `order`. A channel either has a
    template of its own (I1, P0, F ...) or is answered together with the other channels
    of its class by one request (EAP, EAM, ERP, ERM), those share a single plan entry.
*/
use log::{debug, warn};
use std::collections::HashMap;

use crate::config::DeviceItem;
use super::meter_definitions::Catalogue;
use super::structs::{Calibration, Channel, ChannelKey, ChannelMap, Meter, PollPlanEntry, ReadMode};

struct NodeEntry<'a> {
    node: &'a DeviceItem,
    address: u8,
    channels: Vec<&'a DeviceItem>,
}

pub fn build_meter_list(devices: &[DeviceItem], catalogue: &Catalogue) -> Vec<Meter> {
    let mut nodes: Vec<NodeEntry> = Vec::new();
    let mut node_idx: HashMap<&str, usize> = HashMap::new();
    let mut addresses: HashMap<u8, &str> = HashMap::new();

    /* Collect the nodes */
    for item in devices.iter().filter(|i| i.is_node()) {
        let address = match item.addr.as_ref().and_then(|a| a.to_address()) {
            Some(a) => a,
            None => {
                warn!("{}: meter address missing or invalid, meter is not polled", item.chan);
                continue;
            }
        };

        if let Some(other) = addresses.get(&address) {
            warn!("{}: address {} already used by {}, meter is not polled", item.chan, address, other);
            continue;
        }

        addresses.insert(address, &item.chan);
        node_idx.insert(&item.id, nodes.len());
        nodes.push(NodeEntry { node: item, address, channels: Vec::new() });
    }

    /* Collect the enabled channels of the nodes */
    for item in devices.iter().filter(|i| i.is_channel()) {
        let idx = item.parent.as_deref().and_then(|p| node_idx.get(p));
        match idx {
            None => warn!("No meter node for channel {} ({}), skipping", item.chan, item.id),
            Some(idx) if item.r => nodes[*idx].channels.push(item),
            Some(_) => {}
        }
    }

    nodes
        .into_iter()
        .map(|mut entry| {
            /* stable, equal orders keep the declaration order */
            entry.channels.sort_by_key(|c| c.order);
            form_meter(entry, catalogue)
        })
        .collect()
}

fn form_meter(entry: NodeEntry, catalogue: &Catalogue) -> Meter {
    let node = entry.node;
    let mode = node.readmode;
    let mut channels = ChannelMap::new();
    let mut plan: Vec<PollPlanEntry> = Vec::new();

    for item in entry.channels {
        let key = ChannelKey::new(item.chan.clone());
        let multiplier = item.polltimefctr.max(1);

        let class = match key.class() {
            Some(c) => c,
            None => {
                warn!("No polling rule for channel {} of {}, channel is not polled", key, node.chan);
                continue;
            }
        };

        if channels.contains(&key) {
            warn!("Channel {} of {} declared twice, skipping", key, node.chan);
            continue;
        }

        if let Some(template) = catalogue.find_by_key(mode, &key) {
            plan.push(PollPlanEntry::new(template, multiplier));
        } else if let Some(template) = catalogue.find_by_class(mode, class) {
            match plan.iter_mut().find(|p| p.template == template) {
                Some(existing) => existing.multiplier = existing.multiplier.min(multiplier),
                None => plan.push(PollPlanEntry::new(template, multiplier)),
            }
        } else {
            warn!("No polling rule for channel {} of {}, channel is not polled", key, node.chan);
            continue;
        }

        channels.insert(Channel {
            id: item.id.clone(),
            key,
            class,
            multiplier,
            order: item.order,
        });
    }

    debug!("{} ({:?}): {} channels, {} requests per sweep", node.chan, mode, channels.len(), plan.len());

    Meter {
        address: entry.address,
        name: node.chan.clone(),
        calibration: Calibration::new(node.handkti, node.handktu, node.ks, node.constant),
        password: node.password_bytes(),
        read_mode: mode,
        plan,
        channels,
        cursor: None,
        errors: 0,
    }
}

/// One line summary of a meter for the startup log
pub fn describe(meter: &Meter) -> String {
    let mode = match meter.read_mode {
        ReadMode::Single => "single",
        ReadMode::Array => "array",
        ReadMode::Float => "float",
    };
    format!("{} address: {} mode: {} channels to poll: {}", meter.name, meter.address, mode, meter.channels.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressConfig;
    use crate::metering_mercury::protocol::Decoder;
    use crate::metering_mercury::structs::MeasurementClass;

    fn node(id: &str, addr: u64, name: &str) -> DeviceItem {
        DeviceItem {
            id: id.to_string(),
            foldertype: Some("node".to_string()),
            folder: true,
            chan: name.to_string(),
            addr: Some(AddressConfig::Number(addr)),
            polltimefctr: 1,
            ..Default::default()
        }
    }

    fn chan(id: &str, parent: &str, key: &str, factor: u32, order: i64) -> DeviceItem {
        DeviceItem {
            id: id.to_string(),
            parent: Some(parent.to_string()),
            chan: key.to_string(),
            r: true,
            polltimefctr: factor,
            order,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_follows_order() {
        let c = Catalogue::new();
        let devices = vec![
            node("n1", 75, "Meter 101"),
            chan("c3", "n1", "U1", 1, 30),
            chan("c1", "n1", "I1", 10, 10),
            chan("c2", "n1", "F", 1, 20),
        ];
        let meters = build_meter_list(&devices, &c);
        assert_eq!(meters.len(), 1);

        let m = &meters[0];
        assert_eq!(m.address, 75);
        assert_eq!(m.name, "Meter 101");
        assert_eq!(m.cursor, None);
        assert_eq!(m.password, [1; 6]);

        let keys: Vec<String> = m
            .plan
            .iter()
            .map(|p| c.get(p.template).unwrap().chan.clone().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["I1", "F", "U1"]);
        assert_eq!(m.plan[0].multiplier, 10);
        assert!(m.plan.iter().all(|p| p.countdown == 0));
    }

    #[test]
    fn test_energy_channels_coalesce() {
        let c = Catalogue::new();
        let devices = vec![
            node("n1", 75, "Meter 101"),
            chan("e1", "n1", "EAP", 5, 1),
            chan("i1", "n1", "I1", 1, 2),
            chan("e2", "n1", "EAM", 3, 3),
            chan("e3", "n1", "ERP", 7, 4),
        ];
        let m = &build_meter_list(&devices, &c)[0];

        assert_eq!(m.plan.len(), 2);
        let energy = c.get(m.plan[0].template).unwrap();
        assert_eq!(energy.decoder, Decoder::EnergyTotals);
        assert_eq!(m.plan[0].multiplier, 3);
        assert_eq!(m.channels.len(), 4);
        assert_eq!(m.channels.of_class(MeasurementClass::Energy).count(), 3);
    }

    #[test]
    fn test_float_mode_coalesces_phases() {
        let c = Catalogue::new();
        let mut n = node("n1", 12, "Float meter");
        n.readmode = ReadMode::Float;
        let devices = vec![
            n,
            chan("p1", "n1", "P1", 4, 1),
            chan("p2", "n1", "P2", 2, 2),
            chan("f", "n1", "F", 1, 3),
        ];
        let m = &build_meter_list(&devices, &c)[0];
        assert_eq!(m.plan.len(), 2);
        assert_eq!(c.get(m.plan[0].template).unwrap().decoder, Decoder::FloatGroup);
        assert_eq!(m.plan[0].multiplier, 2);
    }

    #[test]
    fn test_dropped_items() {
        let c = Catalogue::new();
        let mut no_addr = node("n2", 0, "No address");
        no_addr.addr = None;
        let mut disabled = chan("c2", "n1", "U2", 1, 2);
        disabled.r = false;

        let devices = vec![
            node("n1", 75, "Meter 101"),
            no_addr,
            node("n3", 75, "Same address"),
            chan("c1", "n1", "U1", 1, 1),
            disabled,
            chan("c3", "n2", "U1", 1, 1),
            chan("c4", "nx", "U1", 1, 1),
            chan("c5", "n1", "X1", 1, 5),
            chan("c6", "n1", "I0", 1, 6),
            chan("c7", "n1", "U1", 1, 7),
        ];
        let meters = build_meter_list(&devices, &c);
        assert_eq!(meters.len(), 1);
        let m = &meters[0];
        assert_eq!(m.channels.len(), 1);
        assert_eq!(m.plan.len(), 1);
        assert_eq!(m.channels.get(&ChannelKey::new("U1")).unwrap().id, "c1");
    }

    #[test]
    fn test_meter_without_channels_is_kept() {
        let c = Catalogue::new();
        let meters = build_meter_list(&[node("n1", 9, "Idle")], &c);
        assert_eq!(meters.len(), 1);
        assert!(meters[0].plan.is_empty());
        assert_eq!(describe(&meters[0]), "Idle address: 9 mode: single channels to poll: 0");
    }

    #[test]
    fn test_same_input_same_output() {
        let c = Catalogue::new();
        let devices = vec![
            node("a", 1, "A"),
            node("b", 2, "B"),
            chan("c1", "b", "P0", 1, 1),
            chan("c2", "a", "Q1", 1, 1),
        ];
        let first = build_meter_list(&devices, &c);
        let second = build_meter_list(&devices, &c);
        assert_eq!(first, second);
        assert_eq!(first[0].name, "A");
        assert_eq!(first[1].name, "B");
    }
}
