//! Per-model register map: a pure data table, never a subclass hierarchy.
//!
//! Grounded in the vendor's published register addresses for the two known
//! inverter families. Both models carry the same set of logical register
//! names; a model that doesn't support a given register simply maps it to
//! address 0.

use std::collections::BTreeMap;

/// Registers that carry plain integers rather than scaled measurements (the
/// six inverter-clock components). Their value is passed through untouched.
const INTEGER_REGISTERS: &[&str] = &[
    "time_register_0",
    "time_register_1",
    "time_register_2",
    "time_register_3",
    "time_register_4",
    "time_register_5",
];

/// Maximum gap between two addresses still merged into the same read group.
const GROUP_GAP_TOLERANCE: u16 = 10;

/// Configuration for a single logical register.
#[derive(Debug, Clone, Copy)]
pub struct RegisterConfig {
    /// Wire address. `0` means "unsupported on this model".
    pub address: u16,
    pub scale: f32,
}

impl RegisterConfig {
    pub const fn new(address: u16) -> Self {
        Self { address, scale: 1.0 }
    }

    pub const fn scaled(address: u16, scale: f32) -> Self {
        Self { address, scale }
    }

    pub fn is_supported(&self) -> bool {
        self.address != 0
    }
}

/// A contiguous-enough run of registers to read in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterGroup {
    pub start: u16,
    pub count: u16,
}

/// Opaque model identifier, e.g. `ISOLAR_SMG_II_11K`.
pub type ModelName = &'static str;

pub const ISOLAR_SMG_II_11K: ModelName = "ISOLAR_SMG_II_11K";
pub const ISOLAR_SMG_II_6K: ModelName = "ISOLAR_SMG_II_6K";

/// The complete register table for one inverter model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub name: ModelName,
    map: BTreeMap<&'static str, RegisterConfig>,
}

impl ModelConfig {
    pub fn get(&self, logical_name: &str) -> Option<&RegisterConfig> {
        self.map.get(logical_name)
    }

    pub fn is_integer_register(logical_name: &str) -> bool {
        INTEGER_REGISTERS.contains(&logical_name)
    }

    /// Applies the register's scale factor, or returns the raw value
    /// untouched for integer-typed registers (the six clock components).
    pub fn decode(&self, logical_name: &str, raw: i32) -> f32 {
        if Self::is_integer_register(logical_name) {
            return raw as f32;
        }
        match self.get(logical_name) {
            Some(config) => raw as f32 * config.scale,
            None => raw as f32,
        }
    }

    /// Deterministic, sorted-and-merged read groups covering every supported
    /// address exactly once. Addresses whose gap to the next supported
    /// address is at most [`GROUP_GAP_TOLERANCE`] are merged into one group,
    /// at the cost of reading (and discarding) the unused registers between
    /// them.
    pub fn groups(&self) -> Vec<RegisterGroup> {
        let mut addresses: Vec<u16> = self
            .map
            .values()
            .filter(|c| c.is_supported())
            .map(|c| c.address)
            .collect();
        addresses.sort_unstable();
        addresses.dedup();

        let mut groups = Vec::new();
        let mut iter = addresses.into_iter();
        let Some(first) = iter.next() else {
            return groups;
        };
        let mut run_start = first;
        let mut run_end = first;

        for addr in iter {
            if addr <= run_end + GROUP_GAP_TOLERANCE {
                run_end = addr;
            } else {
                groups.push(RegisterGroup {
                    start: run_start,
                    count: run_end - run_start + 1,
                });
                run_start = addr;
                run_end = addr;
            }
        }
        groups.push(RegisterGroup {
            start: run_start,
            count: run_end - run_start + 1,
        });
        groups
    }

    /// Every logical register name this model knows about, supported or not.
    pub fn logical_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.map.keys().copied()
    }
}

/// Looks up a known model by its opaque identifier.
pub fn model_config(name: &str) -> Option<ModelConfig> {
    match name {
        "ISOLAR_SMG_II_11K" => Some(isolar_smg_ii_11k()),
        "ISOLAR_SMG_II_6K" => Some(isolar_smg_ii_6k()),
        _ => None,
    }
}

pub fn known_model_names() -> &'static [ModelName] {
    &[ISOLAR_SMG_II_11K, ISOLAR_SMG_II_6K]
}

fn isolar_smg_ii_11k() -> ModelConfig {
    let mut map = BTreeMap::new();
    map.insert("operation_mode", RegisterConfig::new(201));
    map.insert("battery_voltage", RegisterConfig::scaled(277, 0.1));
    map.insert("battery_current", RegisterConfig::scaled(278, 0.1));
    map.insert("battery_power", RegisterConfig::new(279));
    map.insert("battery_soc", RegisterConfig::new(280));
    map.insert("battery_temperature", RegisterConfig::new(281));
    map.insert("pv_total_power", RegisterConfig::new(302));
    map.insert("pv_charging_power", RegisterConfig::new(303));
    map.insert("pv_charging_current", RegisterConfig::scaled(304, 0.1));
    map.insert("pv_temperature", RegisterConfig::new(305));
    map.insert("pv1_voltage", RegisterConfig::scaled(351, 0.1));
    map.insert("pv1_current", RegisterConfig::scaled(352, 0.1));
    map.insert("pv1_power", RegisterConfig::new(353));
    map.insert("pv2_voltage", RegisterConfig::scaled(389, 0.1));
    map.insert("pv2_current", RegisterConfig::scaled(390, 0.1));
    map.insert("pv2_power", RegisterConfig::new(391));
    map.insert("grid_voltage", RegisterConfig::scaled(338, 0.1));
    map.insert("grid_current", RegisterConfig::scaled(339, 0.1));
    map.insert("grid_power", RegisterConfig::new(340));
    map.insert("grid_frequency", RegisterConfig::new(607));
    map.insert("output_voltage", RegisterConfig::scaled(346, 0.1));
    map.insert("output_current", RegisterConfig::scaled(347, 0.1));
    map.insert("output_power", RegisterConfig::new(348));
    map.insert("output_apparent_power", RegisterConfig::new(349));
    map.insert("output_load_percentage", RegisterConfig::new(350));
    map.insert("output_frequency", RegisterConfig::new(607));
    map.insert("time_register_0", RegisterConfig::new(696));
    map.insert("time_register_1", RegisterConfig::new(697));
    map.insert("time_register_2", RegisterConfig::new(698));
    map.insert("time_register_3", RegisterConfig::new(699));
    map.insert("time_register_4", RegisterConfig::new(700));
    map.insert("time_register_5", RegisterConfig::new(701));
    map.insert("pv_energy_today", RegisterConfig::scaled(702, 0.01));
    map.insert("pv_energy_total", RegisterConfig::scaled(703, 0.01));

    ModelConfig {
        name: ISOLAR_SMG_II_11K,
        map,
    }
}

fn isolar_smg_ii_6k() -> ModelConfig {
    let mut map = BTreeMap::new();
    map.insert("operation_mode", RegisterConfig::new(201));
    map.insert("battery_voltage", RegisterConfig::scaled(215, 0.1));
    map.insert("battery_current", RegisterConfig::scaled(216, 0.1));
    map.insert("battery_power", RegisterConfig::new(217));
    map.insert("battery_soc", RegisterConfig::new(229));
    // DCDC temperature reused as the battery temperature reading on this model.
    map.insert("battery_temperature", RegisterConfig::new(226));
    map.insert("pv_total_power", RegisterConfig::new(223));
    map.insert("pv_charging_power", RegisterConfig::new(224));
    map.insert("pv_charging_current", RegisterConfig::scaled(234, 0.1));
    // Ambiguous in the source: inverter temperature reused for pv_temperature.
    map.insert("pv_temperature", RegisterConfig::new(227));
    map.insert("pv1_voltage", RegisterConfig::scaled(219, 0.1));
    map.insert("pv1_current", RegisterConfig::scaled(220, 0.1));
    map.insert("pv1_power", RegisterConfig::new(223));
    map.insert("pv2_voltage", RegisterConfig::new(0));
    map.insert("pv2_current", RegisterConfig::new(0));
    map.insert("pv2_power", RegisterConfig::new(0));
    map.insert("grid_voltage", RegisterConfig::scaled(202, 0.1));
    map.insert("grid_current", RegisterConfig::new(0));
    map.insert("grid_power", RegisterConfig::new(204));
    map.insert("grid_frequency", RegisterConfig::new(203));
    map.insert("output_voltage", RegisterConfig::scaled(210, 0.1));
    map.insert("output_current", RegisterConfig::scaled(211, 0.1));
    map.insert("output_power", RegisterConfig::new(213));
    map.insert("output_apparent_power", RegisterConfig::new(214));
    map.insert("output_load_percentage", RegisterConfig::scaled(225, 0.01));
    map.insert("output_frequency", RegisterConfig::new(212));
    map.insert("time_register_0", RegisterConfig::new(696));
    map.insert("time_register_1", RegisterConfig::new(697));
    map.insert("time_register_2", RegisterConfig::new(698));
    map.insert("time_register_3", RegisterConfig::new(699));
    map.insert("time_register_4", RegisterConfig::new(700));
    map.insert("time_register_5", RegisterConfig::new(701));
    map.insert("pv_energy_today", RegisterConfig::new(0));
    map.insert("pv_energy_total", RegisterConfig::new(0));

    ModelConfig {
        name: ISOLAR_SMG_II_6K,
        map,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_are_deterministic_and_cover_every_supported_address() {
        let model = model_config(ISOLAR_SMG_II_11K).unwrap();
        let groups = model.groups();
        assert_eq!(groups, model.groups());

        let mut covered = std::collections::HashSet::new();
        for g in &groups {
            for addr in g.start..g.start + g.count {
                covered.insert(addr);
            }
        }
        for config in model.map.values().filter(|c| c.is_supported()) {
            assert!(covered.contains(&config.address), "{} not covered", config.address);
        }
    }

    #[test]
    fn unsupported_address_excluded_from_groups() {
        let model = model_config(ISOLAR_SMG_II_6K).unwrap();
        let groups = model.groups();
        for g in &groups {
            assert!(!(g.start..g.start + g.count).contains(&0));
        }
    }

    #[test]
    fn merging_stops_when_gap_exceeds_tolerance() {
        let model = model_config(ISOLAR_SMG_II_11K).unwrap();
        let groups = model.groups();
        // 201 (operation_mode) sits far from the battery cluster at 277+.
        assert!(groups.iter().any(|g| g.start == 201));
        assert!(groups.iter().any(|g| g.start == 277));
    }

    #[test]
    fn both_models_share_the_same_logical_names() {
        let a: std::collections::BTreeSet<_> = model_config(ISOLAR_SMG_II_11K).unwrap().logical_names().collect();
        let b: std::collections::BTreeSet<_> = model_config(ISOLAR_SMG_II_6K).unwrap().logical_names().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_model_name_is_none() {
        assert!(model_config("NOT_A_MODEL").is_none());
    }

    #[test]
    fn integer_registers_pass_through_without_scaling() {
        let model = model_config(ISOLAR_SMG_II_11K).unwrap();
        assert_eq!(model.decode("time_register_0", 2024), 2024.0);
    }

    #[test]
    fn scaled_registers_apply_scale_factor() {
        let model = model_config(ISOLAR_SMG_II_11K).unwrap();
        assert_eq!(model.decode("battery_voltage", 480), 48.0);
    }
}
