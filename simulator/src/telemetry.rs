use rand::Rng;
use serde::{Deserialize, Serialize};

/// Payload published on `{prefix}/{device}/telemetry`, firmware field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub device_id: String,
    pub ts: i64,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy_wh: f64,
    pub v1: f64,
    pub i1: f64,
    pub p1: f64,
    pub e1_wh: f64,
    pub v3: f64,
    pub i3: f64,
    pub p3: f64,
    pub e3_wh: f64,
    pub rssi: i32,
    pub relay: [u8; 2],
}

/// Command received on `{prefix}/{device}/cmd`. `ch` uses the firmware
/// labels 1 and 3.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub ch: u8,
    pub state: u8,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub ok: bool,
    pub ch: u8,
    pub state: u8,
    pub relay: [u8; 2],
}

/// Simulated load on one relay output.
#[derive(Debug, Clone)]
pub struct Load {
    pub watts: f64,
    pub on: bool,
    pub energy_wh: f64,
}

impl Load {
    pub fn new(watts: f64) -> Self {
        Self {
            watts,
            on: false,
            energy_wh: 0.0,
        }
    }

    /// Integrates energy over `dt_secs`; only draws while switched on.
    pub fn step(&mut self, voltage: f64, dt_secs: f64, rng: &mut impl Rng) -> (f64, f64) {
        if !self.on {
            return (0.0, 0.0);
        }
        let power = (self.watts * rng.gen_range(0.95..1.05)).max(0.0);
        self.energy_wh += power * dt_secs / 3600.0;
        (power / voltage, power)
    }
}

/// Two-channel power controller.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: String,
    pub loads: [Load; 2],
}

impl Device {
    pub fn new(device_id: String, watts1: f64, watts3: f64) -> Self {
        Self {
            device_id,
            loads: [Load::new(watts1), Load::new(watts3)],
        }
    }

    pub fn relay(&self) -> [u8; 2] {
        [u8::from(self.loads[0].on), u8::from(self.loads[1].on)]
    }

    /// Applies a command; `None` when the channel label is unknown.
    pub fn apply(&mut self, cmd: &Command) -> Option<Ack> {
        let idx = match cmd.ch {
            1 => 0,
            3 => 1,
            _ => return None,
        };
        self.loads[idx].on = cmd.state != 0;
        Some(Ack {
            ok: true,
            ch: cmd.ch,
            state: u8::from(self.loads[idx].on),
            relay: self.relay(),
        })
    }

    pub fn sample(&mut self, ts: i64, dt_secs: f64, spike: bool, rng: &mut impl Rng) -> Telemetry {
        let mains = if spike {
            rng.gen_range(255.0..270.0)
        } else {
            rng.gen_range(225.0..235.0)
        };
        let v1 = mains + rng.gen_range(-0.5..0.5);
        let v3 = mains + rng.gen_range(-0.5..0.5);

        let (i1, p1) = self.loads[0].step(v1, dt_secs, rng);
        let (i3, p3) = self.loads[1].step(v3, dt_secs, rng);

        Telemetry {
            device_id: self.device_id.clone(),
            ts,
            voltage: mains,
            current: i1 + i3,
            power: p1 + p3,
            energy_wh: self.loads[0].energy_wh + self.loads[1].energy_wh,
            v1,
            i1,
            p1,
            e1_wh: self.loads[0].energy_wh,
            v3,
            i3,
            p3,
            e3_wh: self.loads[1].energy_wh,
            rssi: rng.gen_range(-75..-45),
            relay: self.relay(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_only_accumulates_while_on() {
        let mut rng = rand::thread_rng();
        let mut device = Device::new("dev1".into(), 100.0, 50.0);

        let idle = device.sample(0, 3600.0, false, &mut rng);
        assert_eq!(idle.e1_wh, 0.0);
        assert_eq!(idle.p1, 0.0);

        device.apply(&Command { ch: 1, state: 1, reason: None }).unwrap();
        let running = device.sample(1, 3600.0, false, &mut rng);
        assert!(running.e1_wh > 90.0 && running.e1_wh < 110.0);
        assert_eq!(running.e3_wh, 0.0);
        assert_eq!(running.relay, [1, 0]);
    }

    #[test]
    fn test_command_uses_firmware_labels() {
        let mut device = Device::new("dev1".into(), 100.0, 50.0);

        let ack = device.apply(&Command { ch: 3, state: 1, reason: None }).unwrap();
        assert_eq!(ack.relay, [0, 1]);
        assert!(device.apply(&Command { ch: 2, state: 1, reason: None }).is_none());
    }

    #[test]
    fn test_spike_exceeds_mains() {
        let mut rng = rand::thread_rng();
        let mut device = Device::new("dev1".into(), 100.0, 50.0);
        let t = device.sample(0, 1.0, true, &mut rng);
        assert!(t.voltage >= 255.0);
    }
}
