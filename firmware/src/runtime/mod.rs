use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use ec_core::fan::TachCapture;
use ec_core::hal::SignalId;
use ec_core::boards::reference::{self, signals};
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::adc::{Adc, AdcChannel};
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::{Input, Level, Output, OutputOpenDrain, OutputType, Pull, Speed};
use embassy_stm32::i2c::{self, I2c};
use embassy_stm32::time::{Hertz, khz};
use embassy_stm32::timer::low_level::CountingMode;
use embassy_stm32::timer::simple_pwm::{PwmPin, SimplePwm};
use embassy_sync::channel::Channel;
use heapless::Vec;
use static_cell::StaticCell;

use crate::events::{ControlEvent, EventQueue};
use crate::hw::Stm32Board;
use crate::hw::analog::{RailAdc, RailChannel};
use crate::reset_cause;

mod control_task;
mod input_task;
mod tach_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

pub(super) static EVENT_QUEUE: EventQueue = Channel::new();
static TACH: StaticCell<[TachCapture; reference::FAN_COUNT]> = StaticCell::new();

/// 12 V input divider: 100k over 10k.
const VIN_DIVIDER: u16 = 11;

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let reset = reset_cause::take();
    let config = hal::Config::default();
    let p = hal::init(config);
    let tach: &'static [TachCapture; reference::FAN_COUNT] =
        TACH.init([TachCapture::new(), TachCapture::new()]);

    let mut outputs = Vec::new();
    for (signal, pin) in [
        (signals::VIN_EN, Output::new(p.PB0, Level::Low, Speed::Low)),
        (signals::STBY_EN, Output::new(p.PB1, Level::Low, Speed::Low)),
        (signals::IO_1V8_EN, Output::new(p.PB2, Level::Low, Speed::Low)),
        (signals::CORE_EN, Output::new(p.PB3, Level::Low, Speed::Low)),
        (signals::DDR_EN, Output::new(p.PB4, Level::Low, Speed::Low)),
        (signals::FAN_EN, Output::new(p.PB5, Level::Low, Speed::Low)),
        (db_enable(0), Output::new(p.PA0, Level::Low, Speed::Low)),
        (db_enable(1), Output::new(p.PA1, Level::Low, Speed::Low)),
        (db_enable(2), Output::new(p.PA2, Level::Low, Speed::Low)),
        (db_enable(3), Output::new(p.PA3, Level::Low, Speed::Low)),
        (db_enable(4), Output::new(p.PA9, Level::Low, Speed::Low)),
        (db_enable(5), Output::new(p.PA10, Level::Low, Speed::Low)),
    ] {
        let _ = outputs.push((signal, pin));
    }

    let mut inputs = Vec::new();
    for (signal, pin) in [
        (signals::STBY_PG, Input::new(p.PB8, Pull::None)),
        (signals::CORE_PG, Input::new(p.PB9, Pull::None)),
        (signals::DDR_PG, Input::new(p.PC6, Pull::None)),
        (signals::FAN_PG, Input::new(p.PC14, Pull::None)),
        (signals::AP_ALIVE, Input::new(p.PC15, Pull::Down)),
    ] {
        let _ = inputs.push((signal, pin));
    }

    let mut rails = Vec::new();
    let _ = rails.push(RailChannel {
        channel: reference::VIN_SENSE,
        pin: p.PA4.degrade_adc(),
        divider: VIN_DIVIDER,
    });

    let pwm = SimplePwm::new(
        p.TIM3,
        Some(PwmPin::new(p.PA6, OutputType::PushPull)),
        Some(PwmPin::new(p.PA7, OutputType::PushPull)),
        None,
        None,
        khz(25),
        CountingMode::EdgeAlignedUp,
    );

    let board = Stm32Board {
        outputs,
        inputs,
        rails: RailAdc::new(Adc::new(p.ADC1), rails),
        sensors: I2c::new_blocking(p.I2C1, p.PB6, p.PB7, Hertz(100_000), i2c::Config::default()),
        pwm,
        ap_reset: Output::new(p.PA11, Level::Low, Speed::Low),
        power_button: OutputOpenDrain::new(p.PA12, Level::High, Speed::Low),
    };

    spawner
        .spawn(control_task::run(board, EVENT_QUEUE.receiver(), tach, reset))
        .expect("failed to spawn control task");

    spawner
        .spawn(input_task::button(
            ExtiInput::new(p.PA5, p.EXTI5, Pull::Up),
            EVENT_QUEUE.sender(),
            ControlEvent::PowerButton,
        ))
        .expect("failed to spawn power button task");
    spawner
        .spawn(input_task::button(
            ExtiInput::new(p.PD2, p.EXTI2, Pull::Up),
            EVENT_QUEUE.sender(),
            ControlEvent::ResetButton,
        ))
        .expect("failed to spawn reset button task");
    spawner
        .spawn(input_task::supply_fault(
            ExtiInput::new(p.PD3, p.EXTI3, Pull::Up),
            EVENT_QUEUE.sender(),
        ))
        .expect("failed to spawn supply fault task");

    spawner
        .spawn(tach_task::run(ExtiInput::new(p.PA8, p.EXTI8, Pull::Up), &tach[0]))
        .expect("failed to spawn fan0 tach task");
    spawner
        .spawn(tach_task::run(ExtiInput::new(p.PD1, p.EXTI1, Pull::Up), &tach[1]))
        .expect("failed to spawn fan1 tach task");

    core::future::pending::<()>().await;
}

fn db_enable(bit: u16) -> SignalId {
    SignalId(signals::DB_EN_BASE + bit)
}
