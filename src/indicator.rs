use crate::hardware::{Level, OutputPin};
use crate::messages::Occupancy;

/// Green/red LED pair for one space.
pub struct Indicator<O> {
    green: O,
    red: O,
}

impl<O: OutputPin> Indicator<O> {
    /// Both LEDs start off until the first `apply`.
    pub fn new(mut green: O, mut red: O) -> Self {
        green.set_level(Level::Low);
        red.set_level(Level::Low);
        Indicator { green, red }
    }

    pub fn apply(&mut self, occupancy: Occupancy) {
        match occupancy {
            Occupancy::Occupied => {
                self.red.set_level(Level::High);
                self.green.set_level(Level::Low);
            }
            Occupancy::Free => {
                self.green.set_level(Level::High);
                self.red.set_level(Level::Low);
            }
        }
    }

    /// Drive each LED directly. Only used by the boot-time lamp test.
    pub fn set_lamps(&mut self, green: Level, red: Level) {
        self.green.set_level(green);
        self.red.set_level(red);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Clone)]
    struct SharedPin(Rc<Cell<Level>>);

    impl OutputPin for SharedPin {
        fn set_level(&mut self, level: Level) {
            self.0.set(level);
        }
    }

    fn indicator() -> (Indicator<SharedPin>, Rc<Cell<Level>>, Rc<Cell<Level>>) {
        let green = Rc::new(Cell::new(Level::High));
        let red = Rc::new(Cell::new(Level::High));
        let ind = Indicator::new(SharedPin(green.clone()), SharedPin(red.clone()));
        (ind, green, red)
    }

    #[test]
    fn test_starts_dark() {
        let (_ind, green, red) = indicator();
        assert_eq!((green.get(), red.get()), (Level::Low, Level::Low));
    }

    #[test]
    fn test_exactly_one_lamp_lit() {
        let (mut ind, green, red) = indicator();
        for occupancy in [
            Occupancy::Occupied,
            Occupancy::Free,
            Occupancy::Free,
            Occupancy::Occupied,
        ] {
            ind.apply(occupancy);
            assert_ne!(green.get(), red.get());
            let expected_red = if occupancy.is_occupied() {
                Level::High
            } else {
                Level::Low
            };
            assert_eq!(red.get(), expected_red);
        }
    }
}
