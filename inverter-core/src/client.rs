//! Orchestrates one poll: builds register groups from the active model,
//! runs the rendezvous + bulk session, and decodes the results into a
//! [`Snapshot`].

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::Utc;
use tracing::{instrument, warn};

use crate::frame::{build_read_request, parse_response, signed_value, FrameError};
use crate::model::{model_config, ModelConfig, ModelName, RegisterGroup};
use crate::rendezvous::RendezvousClient;
use crate::session::run_bulk_session;
use crate::snapshot::{inverter_timestamp, Battery, Grid, Output, OperatingMode, Pv, Snapshot, SystemStatus};

const PROTOCOL_ID: u16 = 0x0001;
const UNIT_ID: u8 = 0x00;
const HANDSHAKE_RETRIES: u32 = 3;

/// Owns one transport stack for one device IP.
pub struct InverterClient {
    inverter_ip: IpAddr,
    local_ip: IpAddr,
    local_port: u16,
    model_name: ModelName,
    model: ModelConfig,
    next_tx_id: u16,
}

impl InverterClient {
    pub fn new(inverter_ip: IpAddr, local_ip: IpAddr, local_port: u16, model_name: ModelName) -> Self {
        let model = model_config(model_name).expect("unknown model name validated at construction");
        Self {
            inverter_ip,
            local_ip,
            local_port,
            model_name,
            model,
            next_tx_id: 0x0001,
        }
    }

    pub fn model_name(&self) -> ModelName {
        self.model_name
    }

    /// Atomically swaps the active model; takes effect for the next poll.
    pub fn set_model(&mut self, model_name: ModelName) -> Result<(), &'static str> {
        let model = model_config(model_name).ok_or("unknown inverter model")?;
        self.model_name = model_name;
        self.model = model;
        Ok(())
    }

    fn next_tx_id(&mut self) -> u16 {
        let id = self.next_tx_id;
        self.next_tx_id = self.next_tx_id.wrapping_add(1);
        id
    }

    /// Runs one full poll cycle: rendezvous, bulk read, decode. Transport
    /// failures (no connection obtained) yield an empty snapshot rather
    /// than propagating, matching "on failure return an empty snapshot";
    /// the coordinator is responsible for turning that into backoff.
    #[instrument(skip(self), fields(inverter_ip = %self.inverter_ip, model = self.model_name))]
    pub async fn poll(&mut self) -> Snapshot {
        let polled_at = Utc::now();
        let groups = self.model.groups();
        if groups.is_empty() {
            return Snapshot::empty(polled_at);
        }

        let mut rendezvous = RendezvousClient::new(self.inverter_ip, self.local_ip, self.local_port);
        let stream = match rendezvous.connect(HANDSHAKE_RETRIES).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "rendezvous failed, returning empty snapshot");
                return Snapshot::empty(polled_at);
            }
        };

        let requests: Vec<Vec<u8>> = groups
            .iter()
            .map(|g| build_read_request(self.next_tx_id(), PROTOCOL_ID, UNIT_ID, g.start, g.count))
            .collect();

        let raw_responses = run_bulk_session(stream, &requests).await;

        let values = self.decode_groups(&groups, &raw_responses);
        self.build_snapshot(values, polled_at)
    }

    /// Decodes every non-empty raw response into the `logical_name -> value`
    /// map, recovering per group: a bad CRC or malformed frame drops only
    /// that group's registers, never the whole poll.
    fn decode_groups(&self, groups: &[RegisterGroup], raw_responses: &[Option<Vec<u8>>]) -> HashMap<&'static str, f32> {
        let mut values = HashMap::new();

        for (group, raw) in groups.iter().zip(raw_responses.iter()) {
            let Some(raw) = raw else {
                continue;
            };

            let parsed = match parse_response(raw, group.count as usize) {
                Ok(p) => p,
                Err(e) => {
                    log_group_decode_failure(group, &e);
                    continue;
                }
            };

            for name in self.model.logical_names() {
                let Some(config) = self.model.get(name) else {
                    continue;
                };
                if !config.is_supported() {
                    continue;
                }
                if config.address < group.start || config.address >= group.start + group.count {
                    continue;
                }
                let idx = (config.address - group.start) as usize;
                let Some(&raw_reg) = parsed.registers.get(idx) else {
                    continue;
                };
                values.insert(name, self.model.decode(name, signed_value(raw_reg)));
            }
        }

        values
    }

    fn build_snapshot(&self, values: HashMap<&'static str, f32>, polled_at: chrono::DateTime<Utc>) -> Snapshot {
        Snapshot {
            battery: build_battery(&values),
            pv: build_pv(&values),
            grid: build_grid(&values),
            output: build_output(&values),
            system: build_system_status(&values),
            polled_at,
        }
    }
}

fn log_group_decode_failure(group: &RegisterGroup, err: &FrameError) {
    warn!(start = group.start, count = group.count, error = %err, "register group failed to decode, skipping");
}

fn build_battery(values: &HashMap<&'static str, f32>) -> Option<Battery> {
    let required = [
        "battery_voltage",
        "battery_current",
        "battery_power",
        "battery_soc",
        "battery_temperature",
    ];
    if !required.iter().all(|k| values.contains_key(k)) {
        return None;
    }
    Some(Battery {
        voltage: values["battery_voltage"],
        current: values["battery_current"],
        power: values["battery_power"] as i32,
        soc: values["battery_soc"] as i32,
        temperature: values["battery_temperature"] as i32,
    })
}

fn build_pv(values: &HashMap<&'static str, f32>) -> Option<Pv> {
    let any_present = ["pv_total_power", "pv1_voltage", "pv2_voltage"]
        .iter()
        .any(|k| values.contains_key(k));
    if !any_present {
        return None;
    }
    Some(Pv {
        total_power: values.get("pv_total_power").map(|v| *v as i32),
        charging_power: values.get("pv_charging_power").map(|v| *v as i32),
        charging_current: values.get("pv_charging_current").copied(),
        temperature: values.get("pv_temperature").map(|v| *v as i32),
        pv1_voltage: values.get("pv1_voltage").copied(),
        pv1_current: values.get("pv1_current").copied(),
        pv1_power: values.get("pv1_power").map(|v| *v as i32),
        pv2_voltage: values.get("pv2_voltage").copied(),
        pv2_current: values.get("pv2_current").copied(),
        pv2_power: values.get("pv2_power").map(|v| *v as i32),
        energy_today: values.get("pv_energy_today").copied(),
        energy_total: values.get("pv_energy_total").copied(),
    })
}

fn build_grid(values: &HashMap<&'static str, f32>) -> Option<Grid> {
    let any_present = ["grid_voltage", "grid_power", "grid_frequency"]
        .iter()
        .any(|k| values.contains_key(k));
    if !any_present {
        return None;
    }
    Some(Grid {
        voltage: values.get("grid_voltage").copied(),
        power: values.get("grid_power").map(|v| *v as i32),
        frequency: values.get("grid_frequency").map(|v| *v as i32),
    })
}

fn build_output(values: &HashMap<&'static str, f32>) -> Option<Output> {
    let any_present = ["output_voltage", "output_power"].iter().any(|k| values.contains_key(k));
    if !any_present {
        return None;
    }
    Some(Output {
        voltage: values.get("output_voltage").copied(),
        current: values.get("output_current").copied(),
        power: values.get("output_power").map(|v| *v as i32),
        apparent_power: values.get("output_apparent_power").map(|v| *v as i32),
        load_percentage: values.get("output_load_percentage").map(|v| *v as i32),
        frequency: values.get("output_frequency").map(|v| *v as i32),
    })
}

fn build_system_status(values: &HashMap<&'static str, f32>) -> Option<SystemStatus> {
    let raw_mode = values.get("operation_mode")?;
    let operating_mode = OperatingMode::from_raw(*raw_mode as u16);

    let time_regs = ["time_register_0", "time_register_1", "time_register_2", "time_register_3", "time_register_4", "time_register_5"];
    let inverter_time = if time_regs.iter().all(|k| values.contains_key(*k)) {
        inverter_timestamp(
            values["time_register_0"] as u16,
            values["time_register_1"] as u16,
            values["time_register_2"] as u16,
            values["time_register_3"] as u16,
            values["time_register_4"] as u16,
            values["time_register_5"] as u16,
        )
    } else {
        None
    };

    Some(SystemStatus {
        mode_name: operating_mode.name(),
        operating_mode,
        inverter_time,
    })
}
