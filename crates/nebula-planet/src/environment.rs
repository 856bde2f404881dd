//! Environment state: in-game clock, sun and moon, period colours, and the
//! weather Markov chain that drives fog, wind and thunder.
//!
//! Time of day is measured in hours `[0, 24)`. The sun phase is
//! `(hours / 24) · 2π − π/2`, so the sun rises on +X at 06:00 and is
//! overhead at noon. Lighting is recomputed every update, the weather chain
//! steps once per simulated second and fog is refreshed four times a second.
//! Colours only change when the day period changes.

use bytemuck::{Pod, Zeroable};
use glam::{Quat, Vec2, Vec3};
use nebula_config::{EnvironmentConfig, Season};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::atmosphere::smoothstep;

/// `EnvironmentParams`, lighting and height fog for surface shaders.
pub const ENVIRONMENT_WGSL: &str = include_str!("environment.wgsl");

/// Daylight never drops below this, so night scenes stay readable.
pub const MIN_DAYLIGHT: f32 = 0.18;

/// Seconds between weather transitions.
const WEATHER_STEP_SECONDS: f32 = 1.0;
/// Seconds between fog refreshes.
const FOG_STEP_SECONDS: f32 = 0.25;
const THUNDER_DECAY: f32 = 0.95;
/// Distance of thunder flashes from the origin of the local frame.
const THUNDER_DISTANCE: f32 = 2000.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum WeatherKind {
    #[default]
    Clear,
    Rain,
    Storm,
    Foggy,
    Snow,
}

impl WeatherKind {
    pub const ALL: [WeatherKind; 5] = [
        WeatherKind::Clear,
        WeatherKind::Rain,
        WeatherKind::Storm,
        WeatherKind::Foggy,
        WeatherKind::Snow,
    ];

    /// Outgoing transition probabilities, in roll order.
    #[must_use]
    pub fn transitions(self, season: Season) -> &'static [(WeatherKind, f32)] {
        use WeatherKind::*;
        let winter = season == Season::Winter;
        match self {
            Clear if winter => &[(Snow, 0.4), (Clear, 0.3), (Rain, 0.15), (Foggy, 0.15)],
            Clear => &[(Clear, 0.5), (Rain, 0.25), (Foggy, 0.25)],
            Rain => &[(Storm, 0.3), (Clear, 0.7)],
            Storm => &[(Rain, 0.6), (Clear, 0.4)],
            Foggy if winter => &[(Snow, 0.5), (Clear, 0.5)],
            Foggy | Snow => &[(Clear, 1.0)],
        }
    }

    /// Pick the successor for a uniform `roll` in `[0, 1)`.
    #[must_use]
    pub fn next(self, season: Season, roll: f32) -> WeatherKind {
        let table = self.transitions(season);
        let mut acc = 0.0;
        for &(kind, p) in table {
            acc += p;
            if roll < acc {
                return kind;
            }
        }
        table.last().map_or(WeatherKind::Clear, |&(kind, _)| kind)
    }

    /// Range the target intensity is drawn from.
    #[must_use]
    pub fn intensity_range(self) -> (f32, f32) {
        match self {
            WeatherKind::Clear => (0.0, 0.0),
            WeatherKind::Rain => (0.6, 0.8),
            WeatherKind::Storm => (0.8, 1.0),
            WeatherKind::Foggy => (0.3, 0.6),
            WeatherKind::Snow => (0.4, 0.8),
        }
    }

    /// Per-frame approach rate of the intensity towards its target.
    #[must_use]
    pub fn approach_rate(self) -> f32 {
        if self == WeatherKind::Clear { 0.005 } else { 0.01 }
    }

    /// Fog density multiplier at full intensity.
    fn fog_boost(self) -> f32 {
        match self {
            WeatherKind::Clear => 0.0,
            WeatherKind::Rain => 2.0,
            WeatherKind::Storm => 3.0,
            WeatherKind::Foggy => 8.0,
            WeatherKind::Snow => 4.0,
        }
    }

    /// Wind speed added at full intensity, m/s.
    fn wind_boost(self) -> f32 {
        match self {
            WeatherKind::Storm => 12.0,
            WeatherKind::Rain => 6.0,
            WeatherKind::Snow => 4.0,
            WeatherKind::Clear | WeatherKind::Foggy => 1.0,
        }
    }
}

/// The weather Markov chain. Every step draws exactly two numbers from its
/// generator: the transition roll and the new target intensity.
#[derive(Clone, Debug)]
pub struct WeatherChain {
    kind: WeatherKind,
    target: f32,
    rng: ChaCha8Rng,
}

impl WeatherChain {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            kind: WeatherKind::Clear,
            target: 0.0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn kind(&self) -> WeatherKind {
        self.kind
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    /// Advance one transition and return the new kind.
    pub fn step(&mut self, season: Season) -> WeatherKind {
        let roll = self.rng.random::<f32>();
        let t = self.rng.random::<f32>();
        self.kind = self.kind.next(season, roll);
        let (lo, hi) = self.kind.intensity_range();
        self.target = lo + (hi - lo) * t;
        self.kind
    }
}

/// Coarse part of the day used to cache colours.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum DayPeriod {
    Dawn,
    Morning,
    Noon,
    Afternoon,
    Dusk,
    Night,
}

impl DayPeriod {
    #[must_use]
    pub fn from_hours(hours: f32) -> Self {
        match hours.rem_euclid(24.0) {
            h if (5.0..7.0).contains(&h) => DayPeriod::Dawn,
            h if (7.0..11.0).contains(&h) => DayPeriod::Morning,
            h if (11.0..14.0).contains(&h) => DayPeriod::Noon,
            h if (14.0..17.0).contains(&h) => DayPeriod::Afternoon,
            h if (17.0..19.0).contains(&h) => DayPeriod::Dusk,
            _ => DayPeriod::Night,
        }
    }

    #[must_use]
    pub fn colors(self) -> PeriodColors {
        let c = |r, g, b| Vec3::new(r, g, b);
        match self {
            DayPeriod::Dawn => PeriodColors {
                sun: c(1.0, 0.62, 0.38),
                ambient: c(0.45, 0.40, 0.50),
                fog: c(0.75, 0.62, 0.60),
                zenith: c(0.30, 0.38, 0.60),
                horizon: c(0.95, 0.65, 0.45),
            },
            DayPeriod::Morning => PeriodColors {
                sun: c(1.0, 0.92, 0.80),
                ambient: c(0.55, 0.60, 0.70),
                fog: c(0.72, 0.78, 0.85),
                zenith: c(0.28, 0.48, 0.85),
                horizon: c(0.70, 0.80, 0.92),
            },
            DayPeriod::Noon => PeriodColors {
                sun: c(1.0, 0.98, 0.94),
                ambient: c(0.60, 0.65, 0.75),
                fog: c(0.70, 0.78, 0.88),
                zenith: c(0.22, 0.45, 0.90),
                horizon: c(0.66, 0.78, 0.95),
            },
            DayPeriod::Afternoon => PeriodColors {
                sun: c(1.0, 0.90, 0.75),
                ambient: c(0.58, 0.60, 0.68),
                fog: c(0.74, 0.76, 0.80),
                zenith: c(0.26, 0.45, 0.82),
                horizon: c(0.75, 0.80, 0.88),
            },
            DayPeriod::Dusk => PeriodColors {
                sun: c(1.0, 0.50, 0.30),
                ambient: c(0.40, 0.34, 0.45),
                fog: c(0.62, 0.50, 0.52),
                zenith: c(0.20, 0.22, 0.45),
                horizon: c(0.90, 0.50, 0.35),
            },
            DayPeriod::Night => PeriodColors {
                sun: c(0.30, 0.35, 0.50),
                ambient: c(0.08, 0.10, 0.16),
                fog: c(0.06, 0.07, 0.10),
                zenith: c(0.01, 0.015, 0.04),
                horizon: c(0.04, 0.05, 0.09),
            },
        }
    }
}

/// Cached per-period palette.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeriodColors {
    pub sun: Vec3,
    pub ambient: Vec3,
    pub fog: Vec3,
    pub zenith: Vec3,
    pub horizon: Vec3,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Thunder {
    pub intensity: f32,
    pub position: Vec3,
    /// Elapsed time of the next flash, when one is scheduled.
    pub next_flash_at: Option<f64>,
}

/// Sun direction for `hours`. Spherical worlds tilt the orbit about X.
#[must_use]
pub fn sun_direction(hours: f32, spherical: bool, axial_tilt_degrees: f32) -> Vec3 {
    let phase = hours / 24.0 * std::f32::consts::TAU - std::f32::consts::FRAC_PI_2;
    let sun = Vec3::new(phase.cos(), phase.sin(), 0.0);
    if spherical {
        Quat::from_rotation_x(axial_tilt_degrees.to_radians()) * sun
    } else {
        sun
    }
}

/// Daylight factor against the local `up`, never below [`MIN_DAYLIGHT`].
#[must_use]
pub fn daylight_factor(sun: Vec3, up: Vec3) -> f32 {
    smoothstep(-0.05, 0.25, sun.dot(up)).max(MIN_DAYLIGHT)
}

/// Everything the shading passes read from the environment.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvironmentState {
    pub time_of_day: f32,
    pub elapsed: f64,
    pub season: Season,
    pub period: DayPeriod,
    pub sun_direction: Vec3,
    pub sun_intensity: f32,
    pub sun_color: Vec3,
    pub moon_direction: Vec3,
    pub daylight: f32,
    pub ambient_color: Vec3,
    pub fog_color: Vec3,
    pub fog_density: f32,
    pub zenith_color: Vec3,
    pub horizon_color: Vec3,
    pub weather: WeatherKind,
    pub weather_intensity: f32,
    pub wind_direction: Vec2,
    pub wind_speed: f32,
    pub thunder: Thunder,
}

/// JSON-friendly copy of [`EnvironmentState`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnvironmentSnapshot {
    pub time_of_day: f32,
    pub elapsed: f64,
    pub season: Season,
    pub period: DayPeriod,
    pub sun_direction: [f32; 3],
    pub sun_intensity: f32,
    pub sun_color: [f32; 3],
    pub moon_direction: [f32; 3],
    pub daylight: f32,
    pub ambient_color: [f32; 3],
    pub fog_color: [f32; 3],
    pub fog_density: f32,
    pub weather: WeatherKind,
    pub weather_intensity: f32,
    pub wind_direction: [f32; 2],
    pub wind_speed: f32,
    pub thunder_intensity: f32,
    pub thunder_position: [f32; 3],
}

impl EnvironmentState {
    #[must_use]
    pub fn snapshot(&self) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            time_of_day: self.time_of_day,
            elapsed: self.elapsed,
            season: self.season,
            period: self.period,
            sun_direction: self.sun_direction.to_array(),
            sun_intensity: self.sun_intensity,
            sun_color: self.sun_color.to_array(),
            moon_direction: self.moon_direction.to_array(),
            daylight: self.daylight,
            ambient_color: self.ambient_color.to_array(),
            fog_color: self.fog_color.to_array(),
            fog_density: self.fog_density,
            weather: self.weather,
            weather_intensity: self.weather_intensity,
            wind_direction: self.wind_direction.to_array(),
            wind_speed: self.wind_speed,
            thunder_intensity: self.thunder.intensity,
            thunder_position: self.thunder.position.to_array(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    /// Uniform block consumed by the terrain and feature shaders.
    #[must_use]
    pub fn uniform(&self) -> EnvironmentUniform {
        EnvironmentUniform {
            sun_direction: self.sun_direction.to_array(),
            sun_intensity: self.sun_intensity,
            sun_color: self.sun_color.to_array(),
            daylight: self.daylight,
            ambient_color: self.ambient_color.to_array(),
            fog_density: self.fog_density,
            fog_color: self.fog_color.to_array(),
            fog_scale_height: 0.0,
            wind_direction: self.wind_direction.to_array(),
            wind_speed: self.wind_speed,
            weather_intensity: self.weather_intensity,
            thunder_intensity: self.thunder.intensity,
            season: self.season.index(),
            time: self.elapsed as f32,
            weather: self.weather as u32,
        }
    }
}

/// GPU layout of `EnvironmentParams` in `environment.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct EnvironmentUniform {
    pub sun_direction: [f32; 3],
    pub sun_intensity: f32,
    pub sun_color: [f32; 3],
    pub daylight: f32,
    pub ambient_color: [f32; 3],
    pub fog_density: f32,
    pub fog_color: [f32; 3],
    pub fog_scale_height: f32,
    pub wind_direction: [f32; 2],
    pub wind_speed: f32,
    pub weather_intensity: f32,
    pub thunder_intensity: f32,
    pub season: u32,
    pub time: f32,
    pub weather: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<EnvironmentUniform>(), 96);

/// Owns the clock, the weather chain and the cached palette.
pub struct Environment {
    config: EnvironmentConfig,
    spherical: bool,
    weather: WeatherChain,
    events: ChaCha8Rng,
    state: EnvironmentState,
    colors: PeriodColors,
    weather_timer: f32,
    fog_timer: f32,
    color_refreshes: u32,
}

impl Environment {
    #[must_use]
    pub fn new(config: &EnvironmentConfig, spherical: bool) -> Self {
        let period = DayPeriod::from_hours(config.start_time_of_day);
        let colors = period.colors();
        let hours = config.start_time_of_day.rem_euclid(24.0);
        let sun = sun_direction(hours, spherical, config.axial_tilt_degrees);
        let mut env = Self {
            config: config.clone(),
            spherical,
            weather: WeatherChain::new(config.weather_seed),
            events: ChaCha8Rng::seed_from_u64(config.weather_seed.wrapping_add(0x9E37_79B9_7F4A_7C15)),
            state: EnvironmentState {
                time_of_day: hours,
                elapsed: 0.0,
                season: config.season,
                period,
                sun_direction: sun,
                sun_intensity: 0.0,
                sun_color: colors.sun,
                moon_direction: -sun,
                daylight: MIN_DAYLIGHT,
                ambient_color: colors.ambient,
                fog_color: colors.fog,
                fog_density: config.fog_density,
                zenith_color: colors.zenith,
                horizon_color: colors.horizon,
                weather: WeatherKind::Clear,
                weather_intensity: 0.0,
                wind_direction: Vec2::X,
                wind_speed: 1.0,
                thunder: Thunder::default(),
            },
            colors,
            weather_timer: 0.0,
            fog_timer: 0.0,
            color_refreshes: 0,
        };
        env.update_lighting(Vec3::Y);
        env.refresh_fog();
        env
    }

    pub fn state(&self) -> &EnvironmentState {
        &self.state
    }

    pub fn fog_scale_height(&self) -> f32 {
        self.config.fog_scale_height
    }

    /// Times the period palette was recomputed after construction.
    pub fn color_refreshes(&self) -> u32 {
        self.color_refreshes
    }

    /// Uniform block with the configured fog scale height filled in.
    #[must_use]
    pub fn uniform(&self) -> EnvironmentUniform {
        EnvironmentUniform {
            fog_scale_height: self.config.fog_scale_height,
            ..self.state.uniform()
        }
    }

    /// Advance by `dt` real seconds. `up` is the local up at the camera.
    pub fn update(&mut self, dt: f32, up: Vec3) {
        let dt = dt.max(0.0);
        let s = &mut self.state;
        s.elapsed += f64::from(dt);
        let day = self.config.day_duration_seconds.max(1e-3);
        s.time_of_day = (s.time_of_day + dt * 24.0 / day).rem_euclid(24.0);

        self.update_lighting(up);

        self.weather_timer += dt;
        while self.weather_timer >= WEATHER_STEP_SECONDS {
            self.weather_timer -= WEATHER_STEP_SECONDS;
            self.step_weather();
        }
        self.approach_intensity();
        self.update_thunder();

        self.fog_timer += dt;
        if self.fog_timer >= FOG_STEP_SECONDS {
            self.fog_timer = 0.0;
            self.refresh_fog();
        }
    }

    fn update_lighting(&mut self, up: Vec3) {
        let s = &mut self.state;
        let sun = sun_direction(s.time_of_day, self.spherical, self.config.axial_tilt_degrees);
        s.sun_direction = sun;
        s.moon_direction = -sun;
        s.daylight = daylight_factor(sun, up);
        let overcast = if s.weather == WeatherKind::Clear { 0.0 } else { s.weather_intensity };
        s.sun_intensity = smoothstep(-0.1, 0.15, sun.dot(up)) * (1.0 - 0.5 * overcast);

        let period = DayPeriod::from_hours(s.time_of_day);
        if period != s.period {
            info!("Day period {:?} -> {:?} at {:.2}h", s.period, period, s.time_of_day);
            s.period = period;
            self.colors = period.colors();
            self.color_refreshes += 1;
        }
        s.sun_color = self.colors.sun;
        s.ambient_color = self.colors.ambient * (1.0 - 0.4 * overcast);
        s.zenith_color = self.colors.zenith;
        s.horizon_color = self.colors.horizon;
    }

    fn step_weather(&mut self) {
        let before = self.weather.kind();
        let after = self.weather.step(self.state.season);
        if after != before {
            debug!("Weather {before:?} -> {after:?} (target {:.2})", self.weather.target());
        }
        self.state.weather = after;
        let drift = self.events.random::<f32>() - 0.5;
        let angle = self.state.wind_direction.to_angle() + drift * 0.2;
        self.state.wind_direction = Vec2::from_angle(angle);
    }

    fn approach_intensity(&mut self) {
        let s = &mut self.state;
        let rate = s.weather.approach_rate();
        s.weather_intensity += (self.weather.target() - s.weather_intensity) * rate;
        s.wind_speed = 1.0 + s.weather.wind_boost() * s.weather_intensity;
    }

    fn update_thunder(&mut self) {
        let s = &mut self.state;
        s.thunder.intensity *= THUNDER_DECAY;
        let stormy = s.weather == WeatherKind::Storm
            && s.weather_intensity > 0.5
            && s.season != Season::Winter;
        if !stormy {
            s.thunder.next_flash_at = None;
            return;
        }
        match s.thunder.next_flash_at {
            None => {
                let span = 5.0 * (2.0 - f64::from(s.weather_intensity));
                let jitter = f64::from(self.events.random::<f32>());
                s.thunder.next_flash_at = Some(s.elapsed + span + jitter * span);
            }
            Some(at) if s.elapsed >= at => {
                let angle = self.events.random::<f32>() * std::f32::consts::TAU;
                s.thunder.intensity = 1.0;
                s.thunder.position = Vec3::new(angle.cos(), 0.0, angle.sin()) * THUNDER_DISTANCE;
                s.thunder.next_flash_at = None;
            }
            Some(_) => {}
        }
    }

    fn refresh_fog(&mut self) {
        let s = &mut self.state;
        let i = if s.weather == WeatherKind::Clear { 0.0 } else { s.weather_intensity };
        s.fog_density = self.config.fog_density * (1.0 + s.weather.fog_boost() * i);
        let overcast_fog = Vec3::new(0.55, 0.58, 0.62) * s.daylight;
        s.fog_color = self.colors.fog.lerp(overcast_fog, i * 0.6);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EnvironmentConfig {
        EnvironmentConfig::default()
    }

    /// The sun rises on +X at six and stands overhead at noon.
    #[test]
    fn test_sun_direction_planar() {
        let noon = sun_direction(12.0, false, 23.44);
        assert!((noon - Vec3::Y).length() < 1e-5, "noon {noon}");
        let sunrise = sun_direction(6.0, false, 23.44);
        assert!((sunrise - Vec3::X).length() < 1e-5, "sunrise {sunrise}");
        let midnight = sun_direction(0.0, false, 0.0);
        assert!(midnight.y < -0.99);
    }

    /// Spherical worlds tilt the orbit about X.
    #[test]
    fn test_sun_direction_tilted() {
        let tilt = 23.44f32;
        let noon = sun_direction(12.0, true, tilt);
        let r = tilt.to_radians();
        assert!((noon - Vec3::new(0.0, r.cos(), r.sin())).length() < 1e-5, "noon {noon}");
    }

    /// Night is dim but never pitch black.
    #[test]
    fn test_daylight_minimum() {
        assert_eq!(daylight_factor(-Vec3::Y, Vec3::Y), MIN_DAYLIGHT);
        assert_eq!(daylight_factor(Vec3::Y, Vec3::Y), 1.0);
    }

    fn check_table(season: Season) {
        let mut chain = WeatherChain::new(7);
        let steps = 100_000;
        let mut visits = [0u32; 5];
        let mut counts = [[0u32; 5]; 5];
        let mut from = chain.kind();
        for _ in 0..steps {
            let to = chain.step(season);
            visits[from as usize] += 1;
            counts[from as usize][to as usize] += 1;
            from = to;
        }
        for kind in WeatherKind::ALL {
            let n = f64::from(visits[kind as usize]);
            for &(to, p) in kind.transitions(season) {
                let observed = f64::from(counts[kind as usize][to as usize]);
                let p = f64::from(p);
                if p >= 1.0 {
                    assert_eq!(observed, n, "{kind:?} -> {to:?} is certain");
                    continue;
                }
                let sigma = (n * p * (1.0 - p)).sqrt();
                assert!(
                    (observed - n * p).abs() <= 2.0 * sigma,
                    "{season:?} {kind:?} -> {to:?}: {observed} of {n}, expected {:.0} ± {:.0}",
                    n * p,
                    2.0 * sigma
                );
            }
        }
    }

    /// Transition frequencies over 100 000 steps match the summer table.
    #[test]
    fn test_weather_markov_non_winter() {
        check_table(Season::Summer);
    }

    /// Transition frequencies over 100 000 steps match the winter table.
    #[test]
    fn test_weather_markov_winter() {
        check_table(Season::Winter);
    }

    /// Every transition row sums to one.
    #[test]
    fn test_transition_rows_normalised() {
        for season in [Season::Summer, Season::Winter] {
            for kind in WeatherKind::ALL {
                let sum: f32 = kind.transitions(season).iter().map(|&(_, p)| p).sum();
                assert!((sum - 1.0).abs() < 1e-6, "{season:?} {kind:?} sums to {sum}");
            }
        }
    }

    /// Target intensities stay inside the range of their kind.
    #[test]
    fn test_targets_in_range() {
        let mut chain = WeatherChain::new(3);
        for _ in 0..1000 {
            let kind = chain.step(Season::Autumn);
            let (lo, hi) = kind.intensity_range();
            assert!(chain.target() >= lo && chain.target() <= hi);
        }
    }

    /// Intensity approaches the target at 1% per frame away from clear.
    #[test]
    fn test_intensity_approach() {
        let mut env = Environment::new(&config(), false);
        env.state.weather = WeatherKind::Rain;
        env.weather.kind = WeatherKind::Rain;
        env.weather.target = 0.7;
        env.approach_intensity();
        assert!((env.state.weather_intensity - 0.007).abs() < 1e-6);
    }

    /// A strong storm schedules a flash within ten seconds, and the flash
    /// decays by 5% per frame.
    #[test]
    fn test_thunder_flash_and_decay() {
        let mut env = Environment::new(&config(), false);
        env.state.weather = WeatherKind::Storm;
        env.state.weather_intensity = 1.0;
        let mut flashed = false;
        for _ in 0..110 {
            env.state.elapsed += 0.1;
            env.update_thunder();
            if env.state.thunder.intensity == 1.0 {
                flashed = true;
                break;
            }
        }
        assert!(flashed, "no flash within 11 s");
        assert!((env.state.thunder.position.length() - THUNDER_DISTANCE).abs() < 1e-2);
        env.state.weather = WeatherKind::Clear;
        env.update_thunder();
        assert!((env.state.thunder.intensity - THUNDER_DECAY).abs() < 1e-6);
        assert_eq!(env.state.thunder.next_flash_at, None);
    }

    /// Winter storms do not flash.
    #[test]
    fn test_no_thunder_in_winter() {
        let cfg = EnvironmentConfig {
            season: Season::Winter,
            ..config()
        };
        let mut env = Environment::new(&cfg, false);
        env.state.weather = WeatherKind::Storm;
        env.state.weather_intensity = 1.0;
        env.update_thunder();
        assert_eq!(env.state.thunder.next_flash_at, None);
    }

    /// Colours are recomputed only when the day period changes.
    #[test]
    fn test_period_colors_cached() {
        let cfg = EnvironmentConfig {
            start_time_of_day: 12.0,
            day_duration_seconds: 24.0,
            ..config()
        };
        let mut env = Environment::new(&cfg, false);
        assert_eq!(env.state().period, DayPeriod::Noon);
        // One real second is one in-game hour.
        for _ in 0..10 {
            env.update(0.1, Vec3::Y);
        }
        assert_eq!(env.color_refreshes(), 0);
        for _ in 0..15 {
            env.update(0.1, Vec3::Y);
        }
        assert_eq!(env.state().period, DayPeriod::Afternoon);
        assert_eq!(env.color_refreshes(), 1);
    }

    /// Same seed and updates give identical states; the snapshot is JSON.
    #[test]
    fn test_deterministic_snapshot() {
        let mut a = Environment::new(&config(), false);
        let mut b = Environment::new(&config(), false);
        for _ in 0..600 {
            a.update(1.0 / 30.0, Vec3::Y);
            b.update(1.0 / 30.0, Vec3::Y);
        }
        assert_eq!(a.state(), b.state());
        let json = a.state().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value.get("weather").is_some());
        assert!(value["fog_density"].as_f64().unwrap() > 0.0);
    }

    /// The uniform block carries the configured fog falloff.
    #[test]
    fn test_uniform_fog_scale_height() {
        let env = Environment::new(&config(), false);
        let u = env.uniform();
        assert_eq!(u.fog_scale_height, 1500.0);
        assert_eq!(u.season, Season::Summer.index());
    }
}
