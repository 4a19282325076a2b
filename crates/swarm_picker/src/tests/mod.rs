mod end_game;
mod realtime;
mod scheduling;
