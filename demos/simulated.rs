use std::collections::BTreeMap;

use inquire::{CustomType, Select};
use marstek_venus::coordinator::{Coordinator, PollConfig};
use marstek_venus::{DeviceVersion, Instant, Transport, Value};

// Each menu round advances the simulated clock by one high-tier interval.
const TICK_MS: u64 = 5_000;

/// An in-memory Venus standing in for the real gateway. Charging at a
/// constant rate, it nudges SOC and the energy counters on every read cycle.
struct SimulatedVenus {
    space: BTreeMap<u16, u16>,
}

#[derive(Debug)]
struct Unreachable;

impl SimulatedVenus {
    fn new() -> Self {
        let mut space = BTreeMap::new();
        // Identity block: "Venus-E Sim", firmware 1.51, 2.56 kWh pack.
        let name = b"Venus-E Sim";
        for i in 0..10u16 {
            let hi = name.get(i as usize * 2).copied().unwrap_or(0);
            let lo = name.get(i as usize * 2 + 1).copied().unwrap_or(0);
            space.insert(31000 + i, u16::from_be_bytes([hi, lo]));
        }
        space.insert(31200, 151);
        space.insert(31300, 256);
        space.insert(30300, 58);
        // Battery charging at 560 W, 55% SOC.
        space.insert(32100, 5230);
        space.insert(32101, 1070);
        space.insert(32102, 0);
        space.insert(32103, 560);
        space.insert(32104, 1);
        space.insert(32105, 55);
        space.insert(32110, 42);
        space.insert(33000, 2301);
        space.insert(33001, 260);
        space.insert(33002, 0);
        space.insert(33003, 600);
        space.insert(34001, 51_000);
        space.insert(34003, 44_800);
        space.insert(34005, 56_100);
        space.insert(34007, 40_700);
        space.insert(35000, 312);
        space.insert(35001, 335);
        space.insert(43000, 1);
        space.insert(44000, 955);
        space.insert(44001, 155);
        Self { space }
    }

    /// Crude charge dynamics so successive polls show movement.
    fn step(&mut self) {
        let soc = self.space.get(&32105).copied().unwrap_or(0);
        if soc < 100 {
            self.space.insert(32105, soc + 1);
        }
        let charged = self.space.get(&34001).copied().unwrap_or(0);
        self.space.insert(34001, charged.wrapping_add(8));
    }
}

impl Transport for SimulatedVenus {
    type Error = Unreachable;

    fn read_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, Unreachable> {
        Ok((start..start + count)
            .map(|a| self.space.get(&a).copied().unwrap_or(0))
            .collect())
    }

    fn write_registers(&mut self, start: u16, words: &[u16]) -> Result<(), Unreachable> {
        for (i, &w) in words.iter().enumerate() {
            self.space.insert(start + i as u16, w);
        }
        Ok(())
    }
}

fn main() {
    let mut coord = Coordinator::new(SimulatedVenus::new(), PollConfig::new(DeviceVersion::V2))
        .expect("catalog validation failed");

    // Simulated milliseconds; the coordinator never reads a clock.
    let mut now_ms: u64 = 0;

    loop {
        coord.poll_once(Instant::from_ticks(now_ms));

        let choice = Select::new(
            "Simulated Venus:",
            vec![
                "Show snapshot",
                "Set forcible charge power",
                "Set user work mode",
                "Tick",
                "Quit",
            ],
        )
        .prompt()
        .expect("prompt failed");

        match choice {
            "Show snapshot" => {
                for (name, dv) in coord.handle().all() {
                    let age = dv
                        .age(Instant::from_ticks(now_ms))
                        .map(|d| format!("{}s ago", d.to_secs()))
                        .unwrap_or_else(|| "never".into());
                    let marker = if dv.valid { "" } else { " (invalid)" };
                    println!("{name:>30}: {}{marker}  [{age}]", dv.value);
                }
            }
            "Set forcible charge power" => {
                let watts: f64 = CustomType::new("Charge power in W (0-2500):")
                    .prompt()
                    .expect("prompt failed");
                match coord.submit_write(
                    "forcible_charge_power",
                    &Value::Number(watts),
                    Instant::from_ticks(now_ms),
                ) {
                    Ok(()) => println!("Accepted."),
                    Err(e) => println!("Rejected: {e}"),
                }
            }
            "Set user work mode" => {
                let mode: f64 = CustomType::new("Mode (0 manual, 1 anti-feed, 2 trade):")
                    .prompt()
                    .expect("prompt failed");
                match coord.submit_write(
                    "user_work_mode",
                    &Value::Number(mode),
                    Instant::from_ticks(now_ms),
                ) {
                    Ok(()) => println!("Accepted."),
                    Err(e) => println!("Rejected: {e}"),
                }
            }
            "Tick" => {}
            _ => break,
        }

        coord.transport_mut().step();
        now_ms += TICK_MS;
    }
}
